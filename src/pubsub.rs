// src/pubsub.rs

//! The three invalidation channels shared by every mutation path (§3, §6).

/// Published whenever a `FileInfo` record changes or is removed.
pub const FILE_UPDATE: &str = "file_update";
/// Published whenever a `Mirror` record changes.
pub const MIRROR_UPDATE: &str = "mirror_update";
/// Published whenever a `PerMirrorFile` record changes.
pub const MIRROR_FILE_UPDATE: &str = "mirror_file_update";

pub const ALL_CHANNELS: [&str; 3] = [FILE_UPDATE, MIRROR_UPDATE, MIRROR_FILE_UPDATE];

/// Parses the `"<mirrorID> <path>"` payload shared by `mirror_file_update`
/// and (for the mirror id alone) `mirror_update` messages.
pub fn parse_mirror_file_payload(payload: &str) -> Option<(u64, &str)> {
    let mut parts = payload.splitn(2, ' ');
    let id: u64 = parts.next()?.parse().ok()?;
    let path = parts.next().unwrap_or("");
    Some((id, path))
}
