//! Pass 1: split the import file into groups without touching the store.

use super::{GroupLayout, Progress, RowError, RowErrorKind, RowRole};
use crate::error::LedgerError;
use crate::model::CodeValidator;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// A row that survived pass 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub row_number: u64,
    pub code: String,
}

/// One container and the units to import into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportGroup {
    pub parent: GroupMember,
    pub children: Vec<GroupMember>,
}

#[derive(Debug, Default)]
pub struct ParsedImport {
    pub groups: Vec<ImportGroup>,
    pub errors: Vec<RowError>,
    /// Parent rows seen, including rejected ones
    pub total_groups: u64,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    kind: String,
    code: String,
}

enum Role {
    Parent,
    Child,
}

/// A parent row with the child rows grouped under it, before any validation
struct Draft {
    parent: GroupMember,
    /// The parent row itself was rejected
    parent_rejected: bool,
    children: Vec<GroupMember>,
}

/// Parse `source` into groups, reporting progress from 0 to 50.
pub fn parse_groups(
    source: &[u8],
    codes: &CodeValidator,
    layout: GroupLayout,
    capacity: i64,
    progress: &mut dyn FnMut(u8),
) -> Result<ParsedImport, LedgerError> {
    parse_with_progress(source, codes, layout, capacity, &mut Progress::new(progress))
}

pub(crate) fn parse_with_progress(
    source: &[u8],
    codes: &CodeValidator,
    layout: GroupLayout,
    capacity: i64,
    progress: &mut Progress<'_>,
) -> Result<ParsedImport, LedgerError> {
    progress.report(0);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(source);
    let headers = reader.headers()?.clone();
    for column in ["kind", "code"] {
        if !headers.iter().any(|h| h.eq_ignore_ascii_case(column)) {
            return Err(LedgerError::Import(format!(
                "import header must contain `kind` and `code`, found `{}`",
                headers.iter().collect::<Vec<_>>().join(",")
            )));
        }
    }
    let headers = csv::StringRecord::from(
        headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect::<Vec<_>>(),
    );

    // records stream out of the reader; progress follows the byte offset into the source
    let total = source.len();
    let mut parsed = ParsedImport::default();
    let mut drafts = Vec::new();
    let mut pending: Vec<GroupMember> = Vec::new();
    let mut open: Option<Draft> = None;

    for (index, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                let row = e.position().map_or(0, |p| p.line());
                parsed.errors.push(RowError::new(
                    row,
                    "",
                    RowRole::Unknown,
                    RowErrorKind::Malformed,
                    e.to_string(),
                ));
                continue;
            }
        };
        if let Some(position) = record.position() {
            progress.report_fraction(0, 45, position.byte() as usize, total);
        }
        let row_number = record.position().map_or(index as u64 + 2, |p| p.line());
        let raw: RawRecord = match record.deserialize(Some(&headers)) {
            Ok(raw) => raw,
            Err(e) => {
                parsed.errors.push(RowError::new(
                    row_number,
                    "",
                    RowRole::Unknown,
                    RowErrorKind::Malformed,
                    e.to_string(),
                ));
                continue;
            }
        };

        let role = match raw.kind.to_ascii_lowercase().as_str() {
            "parent" | "p" => Role::Parent,
            "child" | "c" => Role::Child,
            other => {
                parsed.errors.push(RowError::new(
                    row_number,
                    raw.code,
                    RowRole::Unknown,
                    RowErrorKind::UnknownKind,
                    format!("unknown kind '{other}', expected parent or child"),
                ));
                continue;
            }
        };

        let normalized = codes.normalize(&raw.code);
        match role {
            Role::Parent => {
                let (code, parent_rejected) = match normalized {
                    Ok(code) => (code, false),
                    Err(e) => {
                        parsed.errors.push(RowError::new(
                            row_number,
                            raw.code.clone(),
                            RowRole::Parent,
                            RowErrorKind::InvalidCode,
                            e.to_string(),
                        ));
                        (raw.code, true)
                    }
                };
                let parent = GroupMember { row_number, code };
                match layout {
                    GroupLayout::ParentLast => drafts.push(Draft {
                        parent,
                        parent_rejected,
                        children: std::mem::take(&mut pending),
                    }),
                    GroupLayout::ParentFirst => {
                        drafts.extend(open.take());
                        open = Some(Draft {
                            parent,
                            parent_rejected,
                            children: Vec::new(),
                        });
                    }
                }
            }
            Role::Child => {
                let code = match normalized {
                    Ok(code) => code,
                    Err(e) => {
                        parsed.errors.push(RowError::new(
                            row_number,
                            raw.code,
                            RowRole::Child,
                            RowErrorKind::InvalidCode,
                            e.to_string(),
                        ));
                        continue;
                    }
                };
                let child = GroupMember { row_number, code };
                match (layout, open.as_mut()) {
                    (GroupLayout::ParentLast, _) => pending.push(child),
                    (GroupLayout::ParentFirst, Some(draft)) => draft.children.push(child),
                    (GroupLayout::ParentFirst, None) => parsed.errors.push(RowError::new(
                        child.row_number,
                        child.code,
                        RowRole::Child,
                        RowErrorKind::Orphaned,
                        "child appears before any parent row",
                    )),
                }
            }
        }
    }
    drafts.extend(open.take());
    for child in pending {
        parsed.errors.push(RowError::new(
            child.row_number,
            child.code,
            RowRole::Child,
            RowErrorKind::Orphaned,
            "no parent row follows this child",
        ));
    }

    progress.report(45);
    parsed.total_groups = drafts.len() as u64;
    validate_groups(drafts, capacity, &mut parsed);
    progress.report(50);
    Ok(parsed)
}

/// Apply the in-file uniqueness, emptiness and capacity rules, in file order.
fn validate_groups(drafts: Vec<Draft>, capacity: i64, parsed: &mut ParsedImport) {
    // code -> first row it appeared on
    let mut seen: HashMap<String, u64> = HashMap::new();

    for draft in drafts {
        let Draft {
            parent,
            parent_rejected,
            children,
        } = draft;

        if parent_rejected {
            void_children(&children, &parent, "has an invalid code", &mut parsed.errors);
            continue;
        }
        if let Some(&first) = seen.get(&parent.code) {
            parsed.errors.push(RowError::new(
                parent.row_number,
                parent.code.clone(),
                RowRole::Parent,
                RowErrorKind::DuplicateInFile,
                format!("duplicate of row {first}"),
            ));
            void_children(&children, &parent, &format!("duplicates row {first}"), &mut parsed.errors);
            continue;
        }

        // codes enter `seen` only once their group is accepted
        let mut kept = Vec::with_capacity(children.len());
        let mut in_group = HashSet::new();
        for child in children {
            let first = seen
                .get(&child.code)
                .copied()
                .or_else(|| (child.code == parent.code).then_some(parent.row_number))
                .or_else(|| in_group.contains(&child.code).then_some(0));
            match first {
                Some(first) => {
                    let first = kept
                        .iter()
                        .find(|k: &&GroupMember| k.code == child.code)
                        .map_or(first, |k| k.row_number);
                    parsed.errors.push(RowError::new(
                        child.row_number,
                        child.code,
                        RowRole::Child,
                        RowErrorKind::DuplicateInFile,
                        format!("duplicate of row {first}"),
                    ));
                }
                None => {
                    in_group.insert(child.code.clone());
                    kept.push(child);
                }
            }
        }

        if kept.is_empty() {
            parsed.errors.push(RowError::new(
                parent.row_number,
                parent.code,
                RowRole::Parent,
                RowErrorKind::EmptyGroup,
                "parent has no children to import",
            ));
            continue;
        }
        if kept.len() as i64 > capacity {
            parsed.errors.push(RowError::new(
                parent.row_number,
                parent.code.clone(),
                RowRole::Parent,
                RowErrorKind::ExceedsCapacity,
                format!("{} children exceed container capacity {capacity}", kept.len()),
            ));
            void_children(&kept, &parent, "exceeds its capacity", &mut parsed.errors);
            continue;
        }

        seen.insert(parent.code.clone(), parent.row_number);
        for child in &kept {
            seen.insert(child.code.clone(), child.row_number);
        }
        parsed.groups.push(ImportGroup {
            parent,
            children: kept,
        });
    }
}

/// Reject every child of a rejected parent, pointing at the parent row.
pub(crate) fn void_children(
    children: &[GroupMember],
    parent: &GroupMember,
    why: &str,
    errors: &mut Vec<RowError>,
) {
    for child in children {
        errors.push(RowError::new(
            child.row_number,
            child.code.clone(),
            RowRole::Child,
            RowErrorKind::GroupVoided,
            format!("parent '{}' at row {} {why}", parent.code, parent.row_number),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn parse(source: &str, layout: GroupLayout, capacity: i64) -> ParsedImport {
        let codes = CodeValidator::new(&EngineConfig::default().code_pattern).unwrap();
        parse_groups(source.as_bytes(), &codes, layout, capacity, &mut |_| {}).unwrap()
    }

    #[test]
    fn test_parent_last_groups() {
        let parsed = parse(
            "kind,code\nchild,u-1\nchild,u-2\nparent,c-1\nc,u-3\np,c-2\n",
            GroupLayout::ParentLast,
            30,
        );
        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.total_groups, 2);
        assert_eq!(parsed.groups[0].parent.code, "C-1");
        assert_eq!(parsed.groups[0].parent.row_number, 4);
        let children: Vec<_> = parsed.groups[0].children.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(children, vec!["U-1", "U-2"]);
        assert_eq!(parsed.groups[1].children[0].code, "U-3");
    }

    #[test]
    fn test_parent_first_groups_and_orphans() {
        let parsed = parse(
            "kind,code\nchild,u-0\nparent,c-1\nchild,u-1\nparent,c-2\nchild,u-2\n",
            GroupLayout::ParentFirst,
            30,
        );
        assert_eq!(parsed.groups.len(), 2);
        assert_eq!(parsed.groups[1].children[0].code, "U-2");
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].kind, RowErrorKind::Orphaned);
        assert_eq!(parsed.errors[0].row_number, 2);
    }

    #[test]
    fn test_trailing_children_are_orphaned() {
        let parsed = parse("kind,code\nchild,u-1\nparent,c-1\nchild,u-2\n", GroupLayout::ParentLast, 30);
        assert_eq!(parsed.groups.len(), 1);
        assert_eq!(parsed.errors[0].kind, RowErrorKind::Orphaned);
        assert_eq!(parsed.errors[0].code, "U-2");
    }

    #[test]
    fn test_duplicate_parent_voids_group() {
        let parsed = parse(
            "kind,code\nchild,u-1\nparent,c-1\nchild,u-2\nchild,u-3\nparent,c-1\n",
            GroupLayout::ParentLast,
            30,
        );
        assert_eq!(parsed.groups.len(), 1);
        assert_eq!(parsed.total_groups, 2);
        let parent_error = &parsed.errors[0];
        assert_eq!(parent_error.kind, RowErrorKind::DuplicateInFile);
        assert_eq!(parent_error.reason, "duplicate of row 3");
        let voided: Vec<_> = parsed.errors[1..].iter().map(|e| (e.code.as_str(), e.kind)).collect();
        assert_eq!(
            voided,
            vec![("U-2", RowErrorKind::GroupVoided), ("U-3", RowErrorKind::GroupVoided)]
        );
        assert_eq!(parsed.errors[1].reason, "parent 'C-1' at row 6 duplicates row 3");
    }

    #[test]
    fn test_duplicate_child_rejects_only_that_row() {
        let parsed = parse(
            "kind,code\nchild,u-1\nparent,c-1\nchild,u-1\nchild,u-2\nchild,u-2\nparent,c-2\n",
            GroupLayout::ParentLast,
            30,
        );
        assert_eq!(parsed.groups.len(), 2);
        assert_eq!(parsed.groups[1].children.len(), 1);
        let reasons: Vec<_> = parsed.errors.iter().map(|e| (e.row_number, e.reason.as_str())).collect();
        assert_eq!(reasons, vec![(4, "duplicate of row 2"), (6, "duplicate of row 5")]);
    }

    #[test]
    fn test_invalid_rows() {
        let parsed = parse(
            "kind,code\nchild,u-1\nchild,  \nbox,u-9\nparent,c-1\nchild,u-2\nparent,!!\n",
            GroupLayout::ParentLast,
            30,
        );
        assert_eq!(parsed.groups.len(), 1);
        let kinds: Vec<_> = parsed.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RowErrorKind::InvalidCode,
                RowErrorKind::UnknownKind,
                RowErrorKind::InvalidCode,
                RowErrorKind::GroupVoided,
            ]
        );
    }

    #[test]
    fn test_empty_and_oversized_groups() {
        let parsed = parse(
            "kind,code\nparent,c-1\nchild,u-1\nchild,u-2\nchild,u-3\nparent,c-2\n",
            GroupLayout::ParentLast,
            2,
        );
        assert!(parsed.groups.is_empty());
        assert_eq!(parsed.errors[0].kind, RowErrorKind::EmptyGroup);
        assert_eq!(parsed.errors[1].kind, RowErrorKind::ExceedsCapacity);
        assert_eq!(parsed.errors.len(), 5);
    }

    #[test]
    fn test_rejected_group_does_not_claim_its_codes() {
        let parsed = parse(
            "kind,code\nchild,u-1\nchild,u-2\nparent,c-1\nchild,u-1\nparent,c-1\nparent,c-2\n",
            GroupLayout::ParentLast,
            1,
        );
        assert_eq!(parsed.groups.len(), 1);
        assert_eq!(parsed.groups[0].parent.row_number, 6);
        assert_eq!(parsed.groups[0].children[0].row_number, 5);
        let kinds: Vec<_> = parsed.errors.iter().map(|e| (e.row_number, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (4, RowErrorKind::ExceedsCapacity),
                (2, RowErrorKind::GroupVoided),
                (3, RowErrorKind::GroupVoided),
                (7, RowErrorKind::EmptyGroup),
            ]
        );
    }

    #[test]
    fn test_child_reusing_its_parent_code() {
        let parsed = parse("kind,code\nchild,c-1\nchild,u-1\nparent,c-1\n", GroupLayout::ParentLast, 30);
        assert_eq!(parsed.groups.len(), 1);
        assert_eq!(parsed.groups[0].children.len(), 1);
        assert_eq!(parsed.errors[0].kind, RowErrorKind::DuplicateInFile);
        assert_eq!(parsed.errors[0].reason, "duplicate of row 4");
    }

    #[test]
    fn test_missing_header_is_fatal() {
        let codes = CodeValidator::new(&EngineConfig::default().code_pattern).unwrap();
        let result = parse_groups(b"type,value\np,c-1\n", &codes, GroupLayout::ParentLast, 30, &mut |_| {});
        assert!(matches!(result, Err(LedgerError::Import(_))));
    }

    #[test]
    fn test_progress_covers_parse_phase() {
        let codes = CodeValidator::new(&EngineConfig::default().code_pattern).unwrap();
        let mut seen = Vec::new();
        parse_groups(
            b"kind,code\nchild,u-1\nparent,c-1\n",
            &codes,
            GroupLayout::ParentLast,
            30,
            &mut |p| seen.push(p),
        )
        .unwrap();
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&50));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_progress_follows_position_in_source() {
        let codes = CodeValidator::new(&EngineConfig::default().code_pattern).unwrap();
        let mut csv = String::from("kind,code\n");
        for group in 0..100 {
            csv.push_str(&format!("child,u-{group:03}\nparent,c-{group:03}\n"));
        }
        let mut seen = Vec::new();
        let parsed = parse_groups(
            csv.as_bytes(),
            &codes,
            GroupLayout::ParentLast,
            30,
            &mut |p| seen.push(p),
        )
        .unwrap();

        assert_eq!(parsed.groups.len(), 100);
        assert!(seen.contains(&22), "{seen:?}");
        assert!(seen.iter().filter(|&&p| p > 0 && p < 45).count() > 30, "{seen:?}");
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
