//! Subcommands and their JSON output

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use serde_json::{json, Value};

use dualtrack_memory::{
    MemoryError, MemoryId, MemorySystem, RelationType, RetrievalQuery,
};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report size and health of every store
    Stats,

    /// Print one memory
    Get {
        id: MemoryId,
    },

    /// Memories reachable from an anchor
    Related {
        id: MemoryId,

        /// Traversal depth
        #[arg(long)]
        depth: Option<usize>,

        /// Relation types to follow (repeatable)
        #[arg(long = "type")]
        types: Vec<String>,

        #[arg(long)]
        min_importance: Option<f32>,
    },

    /// Search by embedding, optionally anchored
    Search {
        /// Query embedding as a JSON array
        #[arg(long)]
        embedding: String,

        #[arg(long)]
        anchor: Option<MemoryId>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete a memory from every tier
    Delete {
        id: MemoryId,
    },

    /// Run one decay sweep and repair pass now
    Sweep,
}

pub async fn execute(system: &MemorySystem, command: Command) -> Result<Value> {
    match command {
        Command::Stats => Ok(serde_json::to_value(system.report_storage_stats().await)?),

        Command::Get { id } => match system.get_memory(id).await {
            Ok(record) => Ok(serde_json::to_value(record)?),
            Err(MemoryError::NotFound(_)) => bail!("memory {id} not found"),
            Err(e) => Err(e).context("failed to read memory"),
        },

        Command::Related {
            id,
            depth,
            types,
            min_importance,
        } => {
            let types = types.into_iter().map(RelationType::new).collect();
            let result = system
                .get_related(id, depth, types, min_importance)
                .await
                .with_context(|| format!("failed to expand {id}"))?;
            Ok(serde_json::to_value(result)?)
        }

        Command::Search {
            embedding,
            anchor,
            limit,
        } => {
            let embedding: Vec<f32> =
                serde_json::from_str(&embedding).context("embedding must be a JSON array")?;
            let mut query = RetrievalQuery::semantic(embedding);
            query.anchor = anchor;
            query.limit = limit;
            let result = system
                .search_memories(query)
                .await
                .context("search failed")?;
            Ok(serde_json::to_value(result)?)
        }

        Command::Delete { id } => {
            let outcome = system
                .delete_memory(id)
                .await
                .with_context(|| format!("failed to delete {id}"))?;
            Ok(json!({ "id": id, "outcome": outcome }))
        }

        Command::Sweep => {
            let report = system.run_sweep().await;
            let repaired = system.run_repairs().await;
            tracing::info!(
                forgotten = report.forgotten,
                promoted = report.promoted,
                repaired,
                "sweep finished"
            );
            Ok(json!({ "sweep": report, "repaired": repaired }))
        }
    }
}
