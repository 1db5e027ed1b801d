// BLOB version prefix helpers. [version: u8][payload].
// docker_state.data: version 1 = JSON snapshot. container_usage.data: version 1 = wincode ContainerUsage.

pub(super) const SNAPSHOT_BLOB_VERSION: u8 = 1;
pub(super) const USAGE_BLOB_VERSION: u8 = 1;

pub(super) fn with_version_prefix(version: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(version);
    out.extend_from_slice(&payload);
    out
}

/// Payload after the version byte, or `None` when the blob is empty or from an unknown version.
pub(super) fn blob_payload(bytes: &[u8], expected_version: u8) -> Option<&[u8]> {
    match bytes.split_first() {
        Some((v, rest)) if *v == expected_version => Some(rest),
        _ => None,
    }
}
