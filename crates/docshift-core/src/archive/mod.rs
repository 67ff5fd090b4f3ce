//! Archive planning and ZIP materialization.
//!
//! Packing is split in two: [`plan_archives`] is a pure, deterministic
//! partition of the successful outputs under the size ceiling, and
//! [`build_archives`] materializes a plan by reading each member back from
//! the blob store and writing standard ZIP containers.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::storage::BlobStore;

/// One successfully produced output to be packed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveMember {
    pub output_name: String,
    pub storage_key: String,
    pub size: u64,
}

/// A planned archive: name plus members in packing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedArchive {
    pub name: String,
    pub members: Vec<ArchiveMember>,
}

impl PlannedArchive {
    /// Total declared size of the members.
    pub fn total_size(&self) -> u64 {
        self.members.iter().map(|m| m.size).sum()
    }
}

/// Partition of all successful outputs into size-bounded archives.
///
/// Computed once, after every task reaches a terminal state; immutable
/// thereafter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchivePlan {
    pub archives: Vec<PlannedArchive>,
}

impl ArchivePlan {
    pub fn member_count(&self) -> usize {
        self.archives.iter().map(|a| a.members.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }
}

/// A materialized archive ready for download.
#[derive(Debug, Clone)]
pub struct Archive {
    pub name: String,
    pub bytes: Bytes,
}

impl Archive {
    /// Write the archive into `dir`, returning the full path.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(&self.name);
        std::fs::write(&path, &self.bytes)?;
        Ok(path)
    }
}

/// Partition `members` into archives whose total size stays under
/// `ceiling`, preserving input order.
///
/// Greedy single pass: members accumulate into the current archive until
/// the next one would push it past the ceiling, which flushes the
/// accumulator and starts a new archive. A member larger than the ceiling
/// always gets a dedicated archive of its own. A single resulting archive
/// is named `<base>.zip`; multiple archives are numbered
/// `<base>-001.zip`, `<base>-002.zip`, ... in emission order.
pub fn plan_archives(members: Vec<ArchiveMember>, base_name: &str, ceiling: u64) -> ArchivePlan {
    let mut groups: Vec<Vec<ArchiveMember>> = Vec::new();
    let mut current: Vec<ArchiveMember> = Vec::new();
    let mut current_size: u64 = 0;

    for member in members {
        if member.size > ceiling {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                current_size = 0;
            }
            groups.push(vec![member]);
        } else if current_size + member.size > ceiling && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            current_size = member.size;
            current.push(member);
        } else {
            current_size += member.size;
            current.push(member);
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }

    // Names are assigned after the split so a lone archive is unsuffixed.
    let single = groups.len() == 1;
    let archives = groups
        .into_iter()
        .enumerate()
        .map(|(i, members)| PlannedArchive {
            name: if single {
                format!("{}.zip", base_name)
            } else {
                format!("{}-{:03}.zip", base_name, i + 1)
            },
            members,
        })
        .collect();

    ArchivePlan { archives }
}

/// Materialize a plan by reading each member from the blob store.
///
/// A missing blob for a planned member means the orchestrator and the
/// store desynchronized; the member is skipped explicitly and the
/// inconsistency logged rather than silently truncating the archive.
pub async fn build_archives<S: BlobStore>(
    plan: &ArchivePlan,
    store: &S,
) -> anyhow::Result<Vec<Archive>> {
    let mut archives = Vec::with_capacity(plan.archives.len());

    for planned in &plan.archives {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

        for member in &planned.members {
            match store.get(&member.storage_key).await? {
                Some(bytes) => {
                    let options = SimpleFileOptions::default()
                        .compression_method(CompressionMethod::Deflated);
                    writer.start_file(member.output_name.as_str(), options)?;
                    writer.write_all(&bytes)?;
                }
                None => {
                    tracing::error!(
                        key = %member.storage_key,
                        name = %member.output_name,
                        archive = %planned.name,
                        "Result blob missing; skipping member"
                    );
                }
            }
        }

        let cursor = writer.finish()?;
        archives.push(Archive {
            name: planned.name.clone(),
            bytes: Bytes::from(cursor.into_inner()),
        });
    }

    Ok(archives)
}
