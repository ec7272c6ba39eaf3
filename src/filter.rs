//! Per-endpoint allow/block filtering of MAVLink messages.
//!
//! Each endpoint carries independent filters for the incoming and outgoing
//! directions, over three criteria: message id, source system id and source
//! component id. A non-empty allow set admits only listed values; a block
//! set vetoes listed values. A dropped message reports which criterion
//! dropped it so statistics can count filter hits per criterion.

use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The criterion that caused a message to be filtered out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// Dropped by the message-id allow/block sets.
    MsgId,
    /// Dropped by the source-system allow/block sets.
    SrcSys,
    /// Dropped by the source-component allow/block sets.
    SrcComp,
}

/// Filter sets for one endpoint, both directions.
///
/// The field names are the configuration keys: `allow_msg_id_out`,
/// `block_src_sys_in` and so on, each a list of integers in the config
/// file. Allow sets take precedence: with a non-empty allow set the value
/// must be listed; the block set then still vetoes.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EndpointFilters {
    /// Message ids admitted for outgoing traffic (empty = all).
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub allow_msg_id_out: HashSet<u32>,
    /// Message ids vetoed for outgoing traffic.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub block_msg_id_out: HashSet<u32>,
    /// Source component ids admitted for outgoing traffic.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub allow_src_comp_out: HashSet<u8>,
    /// Source component ids vetoed for outgoing traffic.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub block_src_comp_out: HashSet<u8>,
    /// Source system ids admitted for outgoing traffic.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub allow_src_sys_out: HashSet<u8>,
    /// Source system ids vetoed for outgoing traffic.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub block_src_sys_out: HashSet<u8>,

    /// Message ids admitted for incoming traffic (empty = all).
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub allow_msg_id_in: HashSet<u32>,
    /// Message ids vetoed for incoming traffic.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub block_msg_id_in: HashSet<u32>,
    /// Source component ids admitted for incoming traffic.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub allow_src_comp_in: HashSet<u8>,
    /// Source component ids vetoed for incoming traffic.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub block_src_comp_in: HashSet<u8>,
    /// Source system ids admitted for incoming traffic.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub allow_src_sys_in: HashSet<u8>,
    /// Source system ids vetoed for incoming traffic.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub block_src_sys_in: HashSet<u8>,
}

/// `Some(v)` iff `v` is dropped by the allow/block pair.
fn drops<T: std::hash::Hash + Eq>(allow: &HashSet<T>, block: &HashSet<T>, value: &T) -> bool {
    (!allow.is_empty() && !allow.contains(value)) || block.contains(value)
}

impl EndpointFilters {
    /// Checks a frame against the incoming-direction filters.
    ///
    /// Returns `None` when the frame passes, or the criterion that
    /// dropped it.
    pub fn check_incoming(&self, frame: &Frame) -> Option<FilterReason> {
        if drops(&self.allow_msg_id_in, &self.block_msg_id_in, &frame.msg_id) {
            return Some(FilterReason::MsgId);
        }
        if drops(
            &self.allow_src_sys_in,
            &self.block_src_sys_in,
            &frame.src_sysid(),
        ) {
            return Some(FilterReason::SrcSys);
        }
        if drops(
            &self.allow_src_comp_in,
            &self.block_src_comp_in,
            &frame.src_compid(),
        ) {
            return Some(FilterReason::SrcComp);
        }
        None
    }

    /// Checks a frame against the outgoing-direction filters.
    pub fn check_outgoing(&self, frame: &Frame) -> Option<FilterReason> {
        if drops(
            &self.allow_msg_id_out,
            &self.block_msg_id_out,
            &frame.msg_id,
        ) {
            return Some(FilterReason::MsgId);
        }
        if drops(
            &self.allow_src_sys_out,
            &self.block_src_sys_out,
            &frame.src_sysid(),
        ) {
            return Some(FilterReason::SrcSys);
        }
        if drops(
            &self.allow_src_comp_out,
            &self.block_src_comp_out,
            &frame.src_compid(),
        ) {
            return Some(FilterReason::SrcComp);
        }
        None
    }

    /// True when no filter key is set in either direction.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mavlink::{MavHeader, MavlinkVersion};

    fn frame(msg_id: u32, sysid: u8, compid: u8) -> Frame {
        Frame {
            raw: Bytes::from_static(b"x"),
            header: MavHeader {
                system_id: sysid,
                component_id: compid,
                sequence: 0,
            },
            msg_id,
            version: MavlinkVersion::V2,
            target_sysid: crate::frame::NO_TARGET,
            target_compid: crate::frame::NO_TARGET,
        }
    }

    #[test]
    fn test_allow_list_admits_only_listed() {
        let filters = EndpointFilters {
            allow_msg_id_out: HashSet::from([0]),
            ..Default::default()
        };

        assert_eq!(filters.check_outgoing(&frame(0, 1, 1)), None);
        assert_eq!(
            filters.check_outgoing(&frame(1, 1, 1)),
            Some(FilterReason::MsgId)
        );
    }

    #[test]
    fn test_block_list_vetoes() {
        let filters = EndpointFilters {
            block_msg_id_out: HashSet::from([42]),
            ..Default::default()
        };

        assert_eq!(filters.check_outgoing(&frame(0, 1, 1)), None);
        assert_eq!(
            filters.check_outgoing(&frame(42, 1, 1)),
            Some(FilterReason::MsgId)
        );
    }

    #[test]
    fn test_block_wins_inside_allow() {
        let filters = EndpointFilters {
            allow_msg_id_out: HashSet::from([0, 42]),
            block_msg_id_out: HashSet::from([42]),
            ..Default::default()
        };

        assert_eq!(filters.check_outgoing(&frame(0, 1, 1)), None);
        assert_eq!(
            filters.check_outgoing(&frame(42, 1, 1)),
            Some(FilterReason::MsgId)
        );
    }

    #[test]
    fn test_source_system_filtering() {
        let filters = EndpointFilters {
            block_src_sys_in: HashSet::from([9]),
            allow_src_comp_in: HashSet::from([1]),
            ..Default::default()
        };

        assert_eq!(filters.check_incoming(&frame(0, 1, 1)), None);
        assert_eq!(
            filters.check_incoming(&frame(0, 9, 1)),
            Some(FilterReason::SrcSys)
        );
        assert_eq!(
            filters.check_incoming(&frame(0, 1, 2)),
            Some(FilterReason::SrcComp)
        );
    }

    #[test]
    fn test_directions_are_independent() {
        let filters = EndpointFilters {
            block_msg_id_in: HashSet::from([30]),
            ..Default::default()
        };

        assert_eq!(
            filters.check_incoming(&frame(30, 1, 1)),
            Some(FilterReason::MsgId)
        );
        assert_eq!(filters.check_outgoing(&frame(30, 1, 1)), None);
    }
}
