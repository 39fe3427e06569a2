use serde::Serialize;

/// One revision reported by the backup tool's `list` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotEntry {
    pub revision: u32,
    /// Creation time exactly as printed by the tool
    pub date: String,
}

/// Extract `Snapshot <id> revision <n> created at <date>` lines, newest first.
/// Anything else in the output is ignored.
pub fn parse_snapshot_list(output: &str) -> Vec<SnapshotEntry> {
    let mut entries: Vec<SnapshotEntry> = output.lines().filter_map(parse_line).collect();
    entries.sort_by(|a, b| b.revision.cmp(&a.revision));
    entries
}

fn parse_line(line: &str) -> Option<SnapshotEntry> {
    let rest = line.strip_prefix("Snapshot ")?;
    let (id, rest) = rest.split_once(" revision ")?;
    if id.trim().is_empty() {
        return None;
    }

    let (revision, date) = rest.split_once(" created at ")?;
    let revision = revision.parse().ok()?;
    let date = date.trim();
    if date.is_empty() {
        return None;
    }

    Some(SnapshotEntry {
        revision,
        date: date.to_string(),
    })
}
