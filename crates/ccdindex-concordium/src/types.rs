//! Concordium chain entities as handed to handlers.
//!
//! A [`Block`] owns its transactions, transaction events and special events.
//! Events refer back to their transaction by index (`tx_index`) and are
//! resolved through [`Block::transaction_of`] instead of holding a pointer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ccdindex_core::types::Header;

// ─── TransactionSummaryType ───────────────────────────────────────────────────

/// Top-level kind of a block item summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionSummaryType {
    AccountTransaction,
    AccountCreation,
    UpdateTransaction,
}

impl TransactionSummaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccountTransaction => "accountTransaction",
            Self::AccountCreation => "accountCreation",
            Self::UpdateTransaction => "updateTransaction",
        }
    }
}

impl std::fmt::Display for TransactionSummaryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Field access ─────────────────────────────────────────────────────────────

/// A chain datum whose fields can be looked up by name.
pub trait Fields {
    fn fields(&self) -> &Map<String, Value>;

    /// Look up `key`, falling back to a dotted path (`"address.index"`).
    fn field(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.fields().get(key) {
            return Some(v);
        }
        let mut parts = key.split('.');
        let mut current = self.fields().get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields().get(key).and_then(Value::as_str)
    }
}

// ─── Transaction ──────────────────────────────────────────────────────────────

/// A block item summary (`type`, `transactionType`, `hash`, kind-specific fields).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Fields for Transaction {
    fn fields(&self) -> &Map<String, Value> {
        &self.data
    }
}

impl Transaction {
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// The summary type discriminant (`type`).
    pub fn summary_type(&self) -> Option<&str> {
        self.str_field("type")
    }

    pub fn transaction_type(&self) -> Option<&str> {
        self.str_field("transactionType")
    }

    pub fn hash(&self) -> &str {
        self.str_field("hash").unwrap_or_default()
    }

    /// The events embedded in this summary, in the node's order.
    ///
    /// Only account transactions carry events; every other summary type yields none.
    pub fn derive_events(&self) -> Vec<Map<String, Value>> {
        if self.summary_type() != Some(TransactionSummaryType::AccountTransaction.as_str()) {
            return Vec::new();
        }
        let single: &[&str] = match self.transaction_type().unwrap_or_default() {
            "transfer" => &["transfer"],
            "transferWithMemo" | "transferWithScheduleAndMemo" => &["transfer", "memo"],
            "transferWithSchedule" => &["event"],
            "encryptedAmountTransfer" => &["removed", "added"],
            "encryptedAmountTransferWithMemo" => &["removed", "added", "memo"],
            "deployModule" => &["moduleDeployed"],
            "initContract" => &["contractInitialized"],
            "registerData" => &["dataRegistered"],
            "transferToPublic" => &["removed", "added"],
            "transferToEncrypted" => &["added"],
            "addBaker" => &["bakerAdded"],
            "removeBaker" => &["bakerRemoved"],
            "updateBakerKeys" => &["bakerKeysUpdated"],
            "updateBakerStake" => &["bakerStakeChanged"],
            "updateBakerRestakeEarnings" => &["bakerRestakeEarningsUpdated"],
            "updateCredentialKeys" => &["keysUpdated"],
            "updateCredentials" => &["credentialsUpdated"],
            "update" | "configureBaker" | "configureDelegation" => {
                return self
                    .data
                    .get("events")
                    .and_then(Value::as_array)
                    .map(|events| events.iter().filter_map(|e| e.as_object().cloned()).collect())
                    .unwrap_or_default();
            }
            _ => &[],
        };
        single
            .iter()
            .filter_map(|key| self.data.get(*key).and_then(Value::as_object).cloned())
            .collect()
    }
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// An event emitted by a transaction, discriminated by `tag`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    /// Position of this event within the block.
    pub id: usize,
    /// Index of the owning transaction in [`Block::transactions`].
    pub tx_index: usize,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Fields for TransactionEvent {
    fn fields(&self) -> &Map<String, Value> {
        &self.data
    }
}

impl TransactionEvent {
    pub fn tag(&self) -> Option<&str> {
        self.str_field("tag")
    }
}

/// A special (protocol-emitted) event, discriminated by `tag`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecialEvent {
    pub id: usize,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Fields for SpecialEvent {
    fn fields(&self) -> &Map<String, Value> {
        &self.data
    }
}

impl SpecialEvent {
    pub fn tag(&self) -> Option<&str> {
        self.str_field("tag")
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A fully populated block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub block_height: u64,
    pub block_hash: String,
    pub block_parent: String,
    #[serde(default)]
    pub finalization_summary: Value,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub transaction_events: Vec<TransactionEvent>,
    #[serde(default)]
    pub special_events: Vec<SpecialEvent>,
    /// Remaining block info fields (slot time, baker, ...).
    #[serde(flatten)]
    pub info: Map<String, Value>,
}

impl Fields for Block {
    fn fields(&self) -> &Map<String, Value> {
        &self.info
    }
}

impl Block {
    /// Build a block from its info, transactions and special events, deriving
    /// the transaction events from the transactions.
    pub fn assemble(
        header: Header,
        info: Map<String, Value>,
        transactions: Vec<Transaction>,
        special_events: Vec<Map<String, Value>>,
    ) -> Self {
        let mut block = Self {
            block_height: header.height,
            block_hash: header.hash,
            block_parent: header.parent_hash,
            info,
            transactions,
            special_events: special_events
                .into_iter()
                .enumerate()
                .map(|(id, data)| SpecialEvent { id, data })
                .collect(),
            ..Default::default()
        };
        block.derive_transaction_events();
        block
    }

    /// Replace `transaction_events` with the events embedded in each transaction.
    pub fn derive_transaction_events(&mut self) {
        self.transaction_events = self
            .transactions
            .iter()
            .enumerate()
            .flat_map(|(tx_index, tx)| {
                tx.derive_events()
                    .into_iter()
                    .map(move |data| (tx_index, data))
            })
            .enumerate()
            .map(|(id, (tx_index, data))| TransactionEvent { id, tx_index, data })
            .collect();
    }

    pub fn height(&self) -> u64 {
        self.block_height
    }

    pub fn hash(&self) -> &str {
        &self.block_hash
    }

    pub fn header(&self) -> Header {
        Header::new(self.block_height, &self.block_hash, &self.block_parent)
    }

    /// The transaction that emitted `event`.
    pub fn transaction_of(&self, event: &TransactionEvent) -> Option<&Transaction> {
        self.transactions.get(event.tx_index)
    }

    /// Events emitted by the transaction at `tx_index`, in chain order.
    pub fn events_of(&self, tx_index: usize) -> impl Iterator<Item = &TransactionEvent> {
        self.transaction_events
            .iter()
            .filter(move |e| e.tx_index == tx_index)
    }
}
