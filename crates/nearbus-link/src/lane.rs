/// Lane lifecycle — request, share, release.
///
/// A lane binds one session request to one resolved path. The selector
/// owns the reference counts; the `Lane` values handed out are cheap
/// clones carrying the resolved path data. A path is resolved exactly once
/// per request; retrying a session means releasing the old lane first.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::LinkError;
use crate::provider::{LinkProvider, PathInfo};
use crate::types::{DataClass, DeviceId, LinkType};

/// Opaque lane identity.
pub type LaneId = Uuid;

/// A resolved, capability-tagged network path for one session.
#[derive(Debug, Clone)]
pub struct Lane {
    pub id: LaneId,
    pub peer: DeviceId,
    pub path: PathInfo,
}

struct LaneEntry {
    lane: Lane,
    refs: u32,
}

/// Resolves session requests into lanes and tracks their lifetimes.
///
/// Shared behind an `Arc`; the registry lock is held only for map access,
/// never across a provider call.
pub struct LaneSelector {
    provider: Arc<dyn LinkProvider>,
    active: Mutex<HashMap<LaneId, LaneEntry>>,
}

impl LaneSelector {
    pub fn new(provider: Arc<dyn LinkProvider>) -> Self {
        Self {
            provider,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Ask the link layer for a path and register the resulting lane with
    /// one reference.
    pub async fn request_lane(
        &self,
        peer: &DeviceId,
        data_class: DataClass,
        ranked: &[LinkType],
    ) -> Result<Lane, LinkError> {
        let path = self.provider.request_path(peer, data_class, ranked).await?;
        let lane = Lane {
            id: Uuid::new_v4(),
            peer: peer.clone(),
            path,
        };
        tracing::debug!(lane = %lane.id, peer = %peer, "lane resolved");
        self.active.lock().expect("lane registry lock poisoned").insert(
            lane.id,
            LaneEntry {
                lane: lane.clone(),
                refs: 1,
            },
        );
        Ok(lane)
    }

    /// Take an extra reference on an active lane.
    pub fn clone_ref(&self, lane_id: LaneId) -> Result<Lane, LinkError> {
        let mut active = self.active.lock().expect("lane registry lock poisoned");
        let entry = active.get_mut(&lane_id).ok_or(LinkError::UnknownLane {
            lane_id: lane_id.to_string(),
        })?;
        entry.refs += 1;
        Ok(entry.lane.clone())
    }

    /// Drop one reference. At zero the underlying path is released back to
    /// the link layer. Returns `true` when the lane was torn down.
    ///
    /// Releasing an unknown lane is a no-op: teardown paths may race with
    /// each other and the second caller must not fail.
    pub async fn release(&self, lane_id: LaneId) -> bool {
        let torn_down = {
            let mut active = self.active.lock().expect("lane registry lock poisoned");
            match active.get_mut(&lane_id) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    None
                }
                Some(_) => active.remove(&lane_id),
                None => {
                    tracing::debug!(lane = %lane_id, "release of unknown lane ignored");
                    None
                }
            }
        };

        match torn_down {
            Some(entry) => {
                tracing::debug!(lane = %lane_id, "lane released, tearing down path");
                self.provider.release_path(entry.lane.path.path_id).await;
                true
            }
            None => false,
        }
    }

    /// Number of currently active lanes.
    pub fn active_count(&self) -> usize {
        self.active.lock().expect("lane registry lock poisoned").len()
    }
}
