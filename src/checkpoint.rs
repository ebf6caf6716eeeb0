//! Checkpoints: the identity of one protection run.
//!
//! A checkpoint owns a bank section per protected resource under the
//! namespace `/resource_data/{checkpoint_id}/{resource_id}/`. The id is
//! stable for the checkpoint's lifetime; only the underlying bank records
//! evolve.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bank::{Bank, BankError, BankSection};
use crate::protection::{ProtectionStatus, STATUS_KEY};
use crate::resource::ResourceTree;

/// Root namespace for per-resource protection records.
pub const RESOURCE_DATA_PREFIX: &str = "/resource_data";

/// An immutable identifier for one protection run, scoping all resource
/// bank sections.
#[derive(Clone)]
pub struct Checkpoint {
    id: String,
    created_at: DateTime<Utc>,
    bank: Bank,
}

impl Checkpoint {
    /// Create a checkpoint with a fresh id over `bank`.
    pub fn new(bank: Bank) -> Self {
        Self::with_id(bank, Uuid::new_v4().to_string())
    }

    /// Create a checkpoint with a caller-chosen id.
    pub fn with_id(bank: Bank, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            bank,
        }
    }

    /// The checkpoint id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the checkpoint was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The bank this checkpoint persists into.
    pub fn bank(&self) -> &Bank {
        &self.bank
    }

    /// The bank section holding `resource_id`'s records for this run.
    pub fn resource_section(&self, resource_id: &str) -> BankSection {
        self.bank.section(&format!(
            "{RESOURCE_DATA_PREFIX}/{}/{}/",
            self.id, resource_id
        ))
    }

    /// Aggregate protection status over every resource in `tree`.
    ///
    /// The checkpoint is failed if any resource reports an error, available
    /// only when all resources do, and otherwise still protecting. A
    /// resource without a status record counts as in progress.
    pub async fn status(&self, tree: &ResourceTree) -> Result<ProtectionStatus, BankError> {
        let mut all_available = true;
        for node in tree.post_order() {
            let section = self.resource_section(&tree.resource(node).id);
            let status = match section.get(STATUS_KEY).await {
                Ok(value) => serde_json::from_value::<ProtectionStatus>(value)
                    .unwrap_or(ProtectionStatus::Error),
                Err(BankError::NotFound(_)) => {
                    all_available = false;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match status {
                ProtectionStatus::Error => return Ok(ProtectionStatus::Error),
                ProtectionStatus::Available => {}
                _ => all_available = false,
            }
        }
        Ok(if all_available {
            ProtectionStatus::Available
        } else {
            ProtectionStatus::Protecting
        })
    }
}
