//! Duplicate detection and pass 2 bulk writes.
//!
//! Everything after parsing runs in one store transaction: either the whole accepted set is
//! written (parents, children, links, counters and the import run row) or nothing is.

use super::parse::{parse_with_progress, void_children, ImportGroup};
use super::{ImportReport, Progress, RowError, RowErrorKind, RowRole};
use crate::engine::LinkEngine;
use crate::error::LedgerError;
use crate::model::{EntityKind, Level};
use crate::store::{ImportRun, LedgerStore, LedgerTx, NewEntity};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

#[derive(Default)]
struct Written {
    parents: u64,
    children: u64,
    links: u64,
}

/// Run a whole import: parse, detect store duplicates, bulk write.
///
/// Row problems are reported in the returned [`ImportReport`]; an `Err` means the store
/// failed and nothing was written.
///
/// The source is buffered once so its digest covers exactly the bytes parsed, and the
/// accepted groups are held until the single write transaction commits. Memory therefore
/// grows with the file; `insert_chunk_size` and `lookup_chunk_size` bound statement size,
/// not the working set. Split very large files into several imports.
pub fn run_bulk_import<S: LedgerStore, R: Read>(
    engine: &LinkEngine<S>,
    mut source: R,
    caller_id: i64,
    progress: &mut dyn FnMut(u8),
) -> Result<ImportReport, LedgerError> {
    let config = engine.config();
    let mut progress = Progress::new(progress);

    let mut bytes = Vec::new();
    source.read_to_end(&mut bytes)?;
    let source_sha256 = format!("{:x}", Sha256::digest(&bytes));
    let import_id = Uuid::new_v4();

    let mut parsed = {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::import_span("parse").entered();
        parse_with_progress(
            &bytes,
            engine.codes(),
            config.import_layout,
            config.default_container_capacity,
            &mut progress,
        )?
    };
    log::debug!(
        "import {import_id}: parsed {} groups, {} rows rejected in pass 1",
        parsed.total_groups,
        parsed.errors.len()
    );

    let groups = std::mem::take(&mut parsed.groups);
    let mut errors = std::mem::take(&mut parsed.errors);
    let total_groups = parsed.total_groups;

    let written = engine.store().transaction(|tx| {
        let accepted = {
            #[cfg(feature = "tracing")]
            let _span = tracing_helpers::import_span("dedupe").entered();
            drop_existing(tx, groups, config.lookup_chunk_size, &mut errors, &mut progress)?
        };

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::import_span("write").entered();
        let written = write_groups(tx, &accepted, engine, &mut progress)?;

        tx.record_import(&ImportRun {
            id: import_id,
            caller_id,
            source_sha256: source_sha256.clone(),
            total_groups,
            parents_created: written.parents,
            children_created: written.children,
            links_created: written.links,
            error_count: errors.len() as u64,
            finished_at: Utc::now(),
        })?;
        Ok(written)
    })?;

    engine.cache().clear();
    errors.sort_by_key(|e| e.row_number);
    progress.report(100);

    #[cfg(feature = "metrics")]
    METRICS.record_import_rows(written.parents + written.children, errors.len() as u64);

    log::info!(
        "import {import_id} by caller {caller_id}: {total_groups} groups, {} containers, {} units, {} links created, {} rows rejected",
        written.parents,
        written.children,
        written.links,
        errors.len()
    );

    Ok(ImportReport {
        import_id,
        caller_id,
        source_sha256,
        total_groups,
        parents_created: written.parents,
        children_created: written.children,
        links_created: written.links,
        errors,
        finished_at: Utc::now(),
    })
}

/// Reject groups and rows whose codes already exist, progress 50 to 64.
///
/// Containers and units share one code namespace for this check.
fn drop_existing(
    tx: &mut dyn LedgerTx,
    groups: Vec<ImportGroup>,
    chunk_size: usize,
    errors: &mut Vec<RowError>,
    progress: &mut Progress<'_>,
) -> Result<Vec<ImportGroup>, LedgerError> {
    let codes: Vec<String> = groups
        .iter()
        .flat_map(|group| {
            std::iter::once(group.parent.code.clone())
                .chain(group.children.iter().map(|child| child.code.clone()))
        })
        .collect();

    let mut existing = HashSet::new();
    let chunks = codes.len().div_ceil(chunk_size);
    for (index, chunk) in codes.chunks(chunk_size).enumerate() {
        existing.extend(tx.existing_codes(&[EntityKind::Container, EntityKind::Unit], chunk)?);
        progress.report_fraction(50, 64, index + 1, chunks);
    }
    progress.report(64);

    let mut accepted = Vec::with_capacity(groups.len());
    for group in groups {
        let ImportGroup { parent, children } = group;
        if existing.contains(&parent.code) {
            errors.push(RowError::new(
                parent.row_number,
                parent.code.clone(),
                RowRole::Parent,
                RowErrorKind::ExistsInStore,
                "already exists",
            ));
            void_children(&children, &parent, "already exists", errors);
            continue;
        }

        let (fresh, taken): (Vec<_>, Vec<_>) = children
            .into_iter()
            .partition(|child| !existing.contains(&child.code));
        for child in taken {
            errors.push(RowError::new(
                child.row_number,
                child.code,
                RowRole::Child,
                RowErrorKind::ExistsInStore,
                "already exists",
            ));
        }
        if fresh.is_empty() {
            errors.push(RowError::new(
                parent.row_number,
                parent.code,
                RowRole::Parent,
                RowErrorKind::EmptyGroup,
                "no importable units left",
            ));
            continue;
        }
        accepted.push(ImportGroup {
            parent,
            children: fresh,
        });
    }
    Ok(accepted)
}

/// Insert containers (65), units (85), links (95), then refresh container counters.
fn write_groups<S: LedgerStore>(
    tx: &mut dyn LedgerTx,
    groups: &[ImportGroup],
    engine: &LinkEngine<S>,
    progress: &mut Progress<'_>,
) -> Result<Written, LedgerError> {
    let config = engine.config();
    let chunk_size = config.insert_chunk_size;
    let mut written = Written::default();

    let parents: Vec<NewEntity> = groups
        .iter()
        .map(|group| NewEntity::parent(group.parent.code.clone(), config.default_container_capacity))
        .collect();
    let mut parent_ids: HashMap<String, i64> = HashMap::with_capacity(parents.len());
    for chunk in parents.chunks(chunk_size) {
        parent_ids.extend(tx.insert_entities(EntityKind::Container, chunk)?);
    }
    written.parents = parent_ids.len() as u64;
    progress.report(65);

    let children: Vec<NewEntity> = groups
        .iter()
        .flat_map(|group| group.children.iter())
        .map(|child| NewEntity::unit(child.code.clone(), config.unit_weight))
        .collect();
    let mut child_ids: HashMap<String, i64> = HashMap::with_capacity(children.len());
    let chunks = children.len().div_ceil(chunk_size);
    for (index, chunk) in children.chunks(chunk_size).enumerate() {
        child_ids.extend(tx.insert_entities(EntityKind::Unit, chunk)?);
        progress.report_fraction(65, 85, index + 1, chunks);
    }
    written.children = child_ids.len() as u64;
    progress.report(85);

    let mut pairs = Vec::with_capacity(children.len());
    for group in groups {
        let parent_id = lookup(&parent_ids, &group.parent.code)?;
        for child in &group.children {
            pairs.push((parent_id, lookup(&child_ids, &child.code)?));
        }
    }
    for chunk in pairs.chunks(chunk_size) {
        written.links += tx.insert_links(Level::UnitToContainer, chunk)?;
    }
    progress.report(95);

    let mut ids: Vec<i64> = parent_ids.into_values().collect();
    ids.sort_unstable();
    for chunk in ids.chunks(chunk_size) {
        tx.refresh_counters(Level::UnitToContainer, chunk)?;
    }
    Ok(written)
}

fn lookup(ids: &HashMap<String, i64>, code: &str) -> Result<i64, LedgerError> {
    ids.get(code)
        .copied()
        .ok_or_else(|| LedgerError::Import(format!("no id returned for inserted code '{code}'")))
}
