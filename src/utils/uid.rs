use std::collections::HashSet;
use std::sync::Mutex;

use uuid::Uuid;

/// Root arc for UUID-derived UIDs (ISO/IEC 9834-8, DICOM PS3.5 B.2)
pub const UUID_UID_ROOT: &str = "2.25";

/// Generator of DICOM unique identifiers.
///
/// Each UID is `2.25.<decimal UUIDv4>`, which is collision resistant on its
/// own. The generator also remembers every UID it handed out, so the same
/// value is never returned twice within the lifetime of one generator.
///
/// The set of issued UIDs only grows, about 100 bytes per UID. A batch of a
/// few thousand images issues three per image, so one generator per run is
/// fine; long-lived services should create a fresh generator per batch.
#[derive(Debug, Default)]
pub struct UidGenerator {
    issued: Mutex<HashSet<String>>,
}

impl UidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new UID.
    pub fn generate(&self) -> String {
        loop {
            let uid = uuid_to_uid(Uuid::new_v4());
            let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
            if issued.insert(uid.clone()) {
                return uid;
            }
            tracing::warn!("UID collision on {}, drawing again", uid);
        }
    }

    /// Number of UIDs handed out so far
    pub fn issued_count(&self) -> usize {
        self.issued
            .lock()
            .map(|s| s.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }
}

/// Convert a UUID to its `2.25.` OID form.
pub fn uuid_to_uid(uuid: Uuid) -> String {
    format!("{}.{}", UUID_UID_ROOT, uuid.as_u128())
}

/// Check the basic UID shape: dot separated numeric components,
/// no leading zeros, at most 64 characters.
pub fn is_valid_uid(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > 64 {
        return false;
    }
    uid.split('.').all(|component| {
        !component.is_empty()
            && component.bytes().all(|b| b.is_ascii_digit())
            && (component == "0" || !component.starts_with('0'))
    })
}
