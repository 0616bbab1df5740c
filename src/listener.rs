//! Bootstrap listener support: the group-info broadcast.
//!
//! When a group is assembled through a connect/accept bootstrap, joiners
//! create their group with [`MEMBER_PENDING`](crate::group::MEMBER_PENDING)
//! and wait for the owner to announce final membership. The announcement
//! rides the reserved first id of the engine's active-message range as a
//! fixed 24-byte frame: group id, the receiver's member index, and the
//! final member count. A frame naming an unknown group is dropped with a
//! warning.

use crate::error::Result;
use crate::group::{Group, MEMBER_PENDING};
use crate::transport::TransportRef;
use crate::wire::{AmId, GroupId};
use log::{debug, warn};
use std::collections::HashMap;

const INFO_FRAME_LEN: usize = 24;

fn pack_info(group_id: GroupId, member_index: u64, member_count: u64) -> [u8; INFO_FRAME_LEN] {
    let mut out = [0u8; INFO_FRAME_LEN];
    out[..8].copy_from_slice(&u64::from(group_id).to_ne_bytes());
    out[8..16].copy_from_slice(&member_index.to_ne_bytes());
    out[16..24].copy_from_slice(&member_count.to_ne_bytes());
    out
}

fn word(data: &[u8], at: usize) -> u64 {
    u64::from_ne_bytes(data[at..at + 8].try_into().unwrap())
}

/// Apply an inbound group-info frame to the matching group, releasing its
/// membership barrier.
pub(crate) fn handle_info_frame(groups: &mut HashMap<GroupId, Group>, data: &[u8]) {
    if data.len() != INFO_FRAME_LEN {
        warn!("malformed group-info frame ({} bytes)", data.len());
        return;
    }
    let group_id = word(data, 0) as GroupId;
    let Some(group) = groups.get_mut(&group_id) else {
        warn!("group-info for unknown group {group_id} dropped");
        return;
    };
    group.params.member_index = word(data, 8);
    group.params.member_count = word(data, 16);
    group.membership_pending = false;
    debug!(
        "group {group_id} membership arrived: member {}/{}",
        group.params.member_index, group.params.member_count
    );
}

/// Announce final membership to every other member of the group.
pub(crate) fn broadcast_info(
    group: &mut Group,
    transport: &TransportRef,
    am_id: AmId,
) -> Result<()> {
    debug_assert_ne!(group.params.member_index, MEMBER_PENDING);
    for idx in 0..group.params.member_count {
        if idx == group.params.member_index {
            continue;
        }
        let ep = group
            .eps
            .lookup(transport, &group.params.resolver, idx)?;
        let info = pack_info(group.params.id, idx, group.params.member_count);
        transport.am_bcopy(ep, am_id, &mut |out: &mut Vec<u8>| {
            out.extend_from_slice(&info);
        })?;
    }
    Ok(())
}
