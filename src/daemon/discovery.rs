//! Service discovery: every non-empty executable regular file directly
//! inside a folder is a service named after its file name.

use super::protocol::ServiceInfo;
use crate::error::{LauncherError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Declared attributes of one executable found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub name: String,
    pub path: PathBuf,
    pub size: i64,
    pub modified_time: String,
}

/// Scan `folder` for service executables, sorted by name.
///
/// Fails only if the folder itself cannot be read; entries that cannot be
/// inspected are logged and skipped.
pub async fn discover(folder: &Path) -> Result<Vec<DiscoveredService>> {
    let folder = tokio::fs::canonicalize(folder)
        .await
        .map_err(|e| LauncherError::io(folder, e))?;
    let mut entries = tokio::fs::read_dir(&folder)
        .await
        .map_err(|e| LauncherError::io(&folder, e))?;

    let mut found = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(LauncherError::io(&folder, e)),
        };
        let path = entry.path();

        // follow symlinks so linked binaries count as services
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if !is_service_executable(&metadata) {
            continue;
        }

        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!("Skipping non UTF-8 file name in {}", folder.display());
            continue;
        };
        let modified_time = metadata
            .modified()
            .map(|t| format_timestamp(DateTime::<Utc>::from(t)))
            .unwrap_or_default();

        debug!("Discovered service '{}' at {}", name, path.display());
        found.push(DiscoveredService {
            name,
            path,
            size: i64::try_from(metadata.len()).unwrap_or(i64::MAX),
            modified_time,
        });
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));
    info!("Found {} services in '{}'", found.len(), folder.display());
    Ok(found)
}

/// Merge discovered services into the registry.
///
/// Known records only get their declared attributes refreshed; runtime
/// fields stay untouched. Returns the number of new records.
pub fn upsert(records: &mut BTreeMap<String, ServiceInfo>, found: Vec<DiscoveredService>) -> usize {
    let mut added = 0;
    for service in found {
        let record = records.entry(service.name.clone()).or_insert_with(|| {
            added += 1;
            ServiceInfo::new(service.name.clone(), String::new())
        });
        record.path = service.path.display().to_string();
        record.size = service.size;
        record.modified_time = service.modified_time;
    }
    added
}

fn is_service_executable(metadata: &Metadata) -> bool {
    metadata.is_file() && metadata.len() > 0 && has_exec_bit(metadata)
}

#[cfg(unix)]
fn has_exec_bit(metadata: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn has_exec_bit(_metadata: &Metadata) -> bool {
    true
}

/// RFC 3339 UTC with second precision, e.g. `2024-05-01T10:00:00Z`.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}
