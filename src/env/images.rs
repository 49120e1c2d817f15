//! Image cleanup policy.
//!
//! Every image is classified into exactly one deletion tier per owning task;
//! images shared by several tasks take the minimum tier, and images backing
//! a running container are forced to `NeverDelete`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Deletion tiers, ordered from most to least protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionTier {
    /// The latest image of any task, including archived tasks.
    NeverDelete,
    /// A historical image of an active task, or any image shared with one.
    RarelyDelete,
    /// A historical image of an archived task.
    SometimesDelete,
    /// Owned only by deleted tasks.
    AlwaysDelete,
}

/// What the cleanup pass needs to know about one task's images.
#[derive(Debug, Clone)]
pub struct TaskImageMetadata {
    /// Image ids in creation order; the last one is the latest.
    pub image_ids: Vec<String>,
    pub is_archived: bool,
    pub is_deleted: bool,
}

impl TaskImageMetadata {
    fn latest_image_id(&self) -> Option<&str> {
        self.image_ids.last().map(String::as_str)
    }
}

/// Classify one image with respect to one owning task.
fn classify_image_tier(image_id: &str, task: &TaskImageMetadata) -> DeletionTier {
    if task.is_deleted {
        return DeletionTier::AlwaysDelete;
    }
    if task.latest_image_id() == Some(image_id) {
        return DeletionTier::NeverDelete;
    }
    if task.is_archived {
        DeletionTier::SometimesDelete
    } else {
        DeletionTier::RarelyDelete
    }
}

/// Map every image to the tasks that reference it.
fn task_ids_by_image<'a>(
    task_metadata_by_task_id: &'a HashMap<String, TaskImageMetadata>,
) -> HashMap<&'a str, Vec<&'a str>> {
    let mut result: HashMap<&str, Vec<&str>> = HashMap::new();
    for (task_id, metadata) in task_metadata_by_task_id {
        for image_id in &metadata.image_ids {
            result.entry(image_id.as_str()).or_default().push(task_id);
        }
    }
    result
}

/// Resolve the effective tier of every known image.
///
/// Shared images take the minimum (most protected) tier across their owning
/// tasks; images in `active_image_ids` back a running container and are
/// forced to `NeverDelete`.
pub fn resolve_tier_by_image(
    task_metadata_by_task_id: &HashMap<String, TaskImageMetadata>,
    active_image_ids: &HashSet<String>,
) -> HashMap<String, DeletionTier> {
    let mut tier_by_image: HashMap<String, DeletionTier> = HashMap::new();
    for (image_id, task_ids) in task_ids_by_image(task_metadata_by_task_id) {
        let tier = task_ids
            .iter()
            .map(|task_id| classify_image_tier(image_id, &task_metadata_by_task_id[*task_id]))
            .min()
            .unwrap_or(DeletionTier::AlwaysDelete);
        tier_by_image.insert(image_id.to_string(), tier);
    }
    for image_id in active_image_ids {
        tier_by_image.insert(image_id.clone(), DeletionTier::NeverDelete);
    }
    tier_by_image
}

/// Compute which images a cleanup pass should delete.
///
/// Deletes every image whose tier is strictly above `minimum_tier` (so
/// `NeverDelete` as the threshold deletes everything else and
/// `AlwaysDelete` deletes nothing), restricted to ids actually present in
/// `existing_image_ids`.
pub fn calculate_image_ids_to_delete(
    task_metadata_by_task_id: &HashMap<String, TaskImageMetadata>,
    active_image_ids: &HashSet<String>,
    existing_image_ids: &HashSet<String>,
    minimum_tier: DeletionTier,
) -> Vec<String> {
    let tier_by_image = resolve_tier_by_image(task_metadata_by_task_id, active_image_ids);
    let mut to_delete: Vec<String> = tier_by_image
        .into_iter()
        .filter(|(image_id, tier)| *tier > minimum_tier && existing_image_ids.contains(image_id))
        .map(|(image_id, _)| image_id)
        .collect();
    to_delete.sort();
    to_delete
}
