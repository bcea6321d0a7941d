//! Mapping registry: CAN-ID metadata lookups.
//!
//! A pure key-value store with three independent maps. Lookups return
//! `Option`; callers supply their own fallback chain (see the CAN metrics
//! processor's pair resolution). Mutated only by `mapping` messages; later
//! mappings overwrite earlier ones for the same key.

use std::collections::BTreeMap;

use crate::protocol::{coerce_id, MappingData};

/// CAN-ID ↔ name, CAN-ID ↔ joint-id, and send-ID ↔ receive-ID associations
/// for one server instance.
#[derive(Debug, Clone, Default)]
pub struct JointRegistry {
    names: BTreeMap<i64, String>,
    joint_ids: BTreeMap<i64, i64>,
    /// send_id -> recv_id
    pair_map: BTreeMap<i64, i64>,
}

impl JointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joint name for a CAN ID, if one was mapped.
    pub fn name(&self, can_id: i64) -> Option<&str> {
        self.names.get(&can_id).map(String::as_str)
    }

    /// Configured joint id for a CAN ID, if one was mapped.
    pub fn joint_id(&self, can_id: i64) -> Option<i64> {
        self.joint_ids.get(&can_id).copied()
    }

    /// Receive ID paired with a send ID, if one was mapped.
    pub fn recv_for(&self, send_id: i64) -> Option<i64> {
        self.pair_map.get(&send_id).copied()
    }

    pub fn insert_name(&mut self, can_id: i64, name: impl Into<String>) {
        self.names.insert(can_id, name.into());
    }

    pub fn insert_joint_id(&mut self, can_id: i64, joint_id: i64) {
        self.joint_ids.insert(can_id, joint_id);
    }

    pub fn insert_pair(&mut self, send_id: i64, recv_id: i64) {
        self.pair_map.insert(send_id, recv_id);
    }

    /// Number of CAN IDs with a configured joint id.
    pub fn joint_id_count(&self) -> usize {
        self.joint_ids.len()
    }

    /// Number of CAN IDs with a configured name.
    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    /// Merge a `mapping` payload into the registry.
    ///
    /// Keys and values that cannot be coerced to integers (or, for names,
    /// to strings) are skipped silently.
    pub fn merge(&mut self, data: &MappingData) {
        for (key, name) in &data.joint_names {
            let Ok(can_id) = key.trim().parse::<i64>() else {
                continue;
            };
            if let Some(name) = name.as_str() {
                self.names.insert(can_id, name.to_string());
            }
        }

        for (key, joint_id) in &data.joint_ids {
            let Ok(can_id) = key.trim().parse::<i64>() else {
                continue;
            };
            if let Some(joint_id) = coerce_id(joint_id) {
                self.joint_ids.insert(can_id, joint_id);
            }
        }

        for (send_id, recv_id) in &data.can_id_map {
            let Ok(send_id) = send_id.trim().parse::<i64>() else {
                continue;
            };
            if let Some(recv_id) = coerce_id(recv_id) {
                self.pair_map.insert(send_id, recv_id);
            }
        }
    }
}
