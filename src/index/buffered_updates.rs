//! Resolution of buffered deletes and doc-values updates against the
//! segments on disk.
//!
//! Every flush ticket publishes one packet of global operations. A packet
//! gets the next generation of the stream; a segment published after it
//! records a higher `buffered_deletes_gen`, so a packet only applies to the
//! segments that existed before it.
//!
//! Within one packet, on one segment:
//!
//! 1. every delete (by term or by query) is resolved first, against the
//!    values the segment had when the packet started,
//! 2. then every update is applied in submission order; a later update of
//!    the same document and field overwrites an earlier one.
//!
//! Updates skip documents that are no longer live, so a delete always wins
//! over an update in the same packet, whether both select the document
//! through the same term or through different ones.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use log::debug;

use crate::error::{HalberdError, Result};
use crate::index::codec::CodecRegistry;
use crate::index::delete_queue::BufferedOp;
use crate::index::merge_policy::MergePolicy;
use crate::index::reader_pool::ReaderPool;
use crate::index::segment_info::SegmentInfo;
use crate::index::segment_infos::SegmentInfos;
use crate::storage::Storage;

/// One published packet of global operations.
#[derive(Debug, Clone)]
pub struct FrozenBufferedUpdates {
    pub generation: u64,
    pub ops: Vec<Arc<BufferedOp>>,
}

impl FrozenBufferedUpdates {
    pub fn num_deletes(&self) -> usize {
        self.ops.iter().filter(|op| op.is_delete()).count()
    }

    pub fn num_updates(&self) -> usize {
        self.ops.len() - self.num_deletes()
    }
}

/// Result of one resolution pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Documents newly marked deleted.
    pub deleted_docs: u64,
    /// Doc-values slots that changed.
    pub updated_values: u64,
    /// Segments removed because no live document was left.
    pub dropped_segments: Vec<String>,
}

impl ApplyOutcome {
    pub fn any_changes(&self) -> bool {
        self.deleted_docs > 0 || self.updated_values > 0 || !self.dropped_segments.is_empty()
    }
}

/// Ordered packets waiting to be resolved.
#[derive(Debug)]
pub struct BufferedUpdatesStream {
    packets: Vec<FrozenBufferedUpdates>,
    next_gen: u64,
}

impl Default for BufferedUpdatesStream {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedUpdatesStream {
    pub fn new() -> Self {
        BufferedUpdatesStream {
            packets: Vec::new(),
            next_gen: 1,
        }
    }

    /// Append a packet. Empty packets take no generation.
    pub fn push(&mut self, ops: Vec<Arc<BufferedOp>>) -> Option<u64> {
        if ops.is_empty() {
            return None;
        }
        let generation = self.next_gen;
        self.next_gen += 1;
        self.packets.push(FrozenBufferedUpdates { generation, ops });
        Some(generation)
    }

    /// Generation the next packet will get. Segments published now record it.
    pub fn next_gen(&self) -> u64 {
        self.next_gen
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn num_packets(&self) -> usize {
        self.packets.len()
    }

    pub fn num_ops(&self) -> usize {
        self.packets.iter().map(|p| p.ops.len()).sum()
    }

    /// Drop every packet. Generations keep increasing.
    pub fn clear(&mut self) {
        self.packets.clear();
    }

    /// Resolve every packet against every segment of `infos`.
    ///
    /// On success the stream is empty and every segment is marked as up to
    /// date. Changes end up in `pool` and are written by the next commit.
    ///
    /// An update that would have to change a live document of a segment
    /// whose codec cannot carry doc-values updates fails the whole pass
    /// before anything is applied. Those update operations are removed from
    /// the stream, so the next pass applies the rest.
    pub fn apply_all(
        &mut self,
        storage: &dyn Storage,
        registry: &CodecRegistry,
        infos: &mut SegmentInfos,
        pool: &mut ReaderPool,
        policy: &dyn MergePolicy,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        if self.packets.is_empty() {
            return Ok(outcome);
        }
        let start = Instant::now();

        self.reject_unsupported_updates(storage, registry, infos, pool)?;

        let segments: Vec<(String, u64)> = infos
            .segments()
            .iter()
            .map(|s| (s.name().to_string(), s.buffered_deletes_gen))
            .collect();
        for (name, seg_gen) in segments {
            let packets: Vec<&FrozenBufferedUpdates> =
                self.packets.iter().filter(|p| p.generation >= seg_gen).collect();
            if packets.is_empty() {
                continue;
            }
            let Some(segment) = infos.get(&name) else {
                continue;
            };
            let entry = pool.get_or_load(storage, registry, segment)?;
            let max_doc = entry.max_doc();
            let core = Arc::clone(entry.core());

            for packet in packets {
                let mut doomed = Vec::new();
                {
                    let view = entry.view();
                    for op in &packet.ops {
                        match op.as_ref() {
                            BufferedOp::DeleteTerm(term) => doomed.extend_from_slice(core.data.docs(term)),
                            BufferedOp::DeleteQuery(query) => {
                                doomed.extend(query.matching_docs(&view, max_doc))
                            }
                            BufferedOp::Update(_) => {}
                        }
                    }
                }
                for doc in doomed {
                    if entry.delete(doc) {
                        outcome.deleted_docs += 1;
                    }
                }

                for op in &packet.ops {
                    let BufferedOp::Update(updates) = op.as_ref() else {
                        continue;
                    };
                    for update in updates {
                        for &doc in core.data.docs(&update.term) {
                            if entry.is_live(doc) && entry.set_doc_value(&update.field, doc, &update.value)? {
                                outcome.updated_values += 1;
                            }
                        }
                    }
                }
            }
        }

        let next_gen = self.next_gen;
        for segment in infos.segments_mut() {
            segment.buffered_deletes_gen = next_gen;
        }
        self.packets.clear();

        let fully_deleted: Vec<String> = infos
            .segments()
            .iter()
            .filter_map(|s| pool.entry(s.name()))
            .filter(|e| e.num_live() == 0 && !e.is_merging() && !policy.keep_fully_deleted_segment(e.name()))
            .map(|e| e.name().to_string())
            .collect();
        for name in fully_deleted {
            debug!("dropping fully deleted segment {name}");
            infos.remove(&name);
            pool.drop_segment(&name);
            outcome.dropped_segments.push(name);
        }

        debug!(
            "applied buffered updates in {:?}: {} deleted docs, {} updated values, {} dropped segments",
            start.elapsed(),
            outcome.deleted_docs,
            outcome.updated_values,
            outcome.dropped_segments.len()
        );
        Ok(outcome)
    }

    /// Fail, and drop the offending updates, if an update targets a live
    /// document of a segment whose codec lacks update support.
    fn reject_unsupported_updates(
        &mut self,
        storage: &dyn Storage,
        registry: &CodecRegistry,
        infos: &SegmentInfos,
        pool: &mut ReaderPool,
    ) -> Result<()> {
        if !self.packets.iter().any(|p| p.num_updates() > 0) {
            return Ok(());
        }

        let mut offending: Vec<Arc<BufferedOp>> = Vec::new();
        let mut first_path: Option<(String, String)> = None;
        for segment in infos.segments() {
            let info = &segment.info;
            let codec = registry.resolve(&info.name, &info.codec_name, info.codec_version)?;
            if codec.supports_doc_values_updates() {
                continue;
            }
            let entry = pool.get_or_load(storage, registry, segment)?;
            for packet in self.packets.iter().filter(|p| p.generation >= segment.buffered_deletes_gen) {
                for op in &packet.ops {
                    let BufferedOp::Update(updates) = op.as_ref() else {
                        continue;
                    };
                    let hits_live_doc = updates
                        .iter()
                        .any(|u| entry.core().data.docs(&u.term).iter().any(|&d| entry.is_live(d)));
                    if hits_live_doc && !offending.iter().any(|o| Arc::ptr_eq(o, op)) {
                        offending.push(Arc::clone(op));
                        first_path.get_or_insert_with(|| {
                            (
                                SegmentInfo::file_name(&info.name),
                                format!(
                                    "segment written by codec {} version {} does not support doc-values updates",
                                    info.codec_name, info.codec_version
                                ),
                            )
                        });
                    }
                }
            }
        }

        let Some((path, detail)) = first_path else {
            return Ok(());
        };
        for packet in &mut self.packets {
            packet.ops.retain(|op| !offending.iter().any(|o| Arc::ptr_eq(o, op)));
        }
        self.packets.retain(|p| !p.ops.is_empty());
        debug!("rejected {} doc-values updates against {path}", offending.len());
        Err(HalberdError::unsupported_format(path, detail))
    }

    /// Operations still buffered, grouped by packet generation.
    pub fn pending_by_gen(&self) -> BTreeMap<u64, usize> {
        self.packets.iter().map(|p| (p.generation, p.ops.len())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocValuesType, FieldValue};
    use crate::index::codec::{Codec, LegacyCodec, SegmentData, StandardCodec};
    use crate::index::doc_values::{DocValue, DocValuesColumn, DocValuesUpdate};
    use crate::index::field_infos::FieldInfos;
    use crate::index::merge_policy::LogMergePolicy;
    use crate::index::query::Query;
    use crate::index::segment_info::SegmentCommitInfo;
    use crate::index::term::Term;
    use crate::storage::memory::MemoryStorage;
    use uuid::Uuid;

    /// Segment with docs `ids`, keyword field `id` and numeric field `val`.
    fn write_segment(storage: &MemoryStorage, codec: &dyn Codec, name: &str, vals: &[i64]) -> SegmentCommitInfo {
        let mut data = SegmentData {
            max_doc: vals.len() as u32,
            ..SegmentData::default()
        };
        let ids = data.postings.entry("id".to_string()).or_default();
        for doc in 0..vals.len() {
            ids.insert(
                FieldValue::Keyword(format!("doc-{doc}")).to_bytes(),
                vec![doc as u32],
            );
        }
        data.stored = vec![Vec::new(); vals.len()];
        data.doc_values.insert(
            "val".to_string(),
            DocValuesColumn::Numeric(vals.iter().map(|v| Some(*v)).collect()),
        );
        let mut files = codec.write_segment(storage, name, &data).unwrap();
        files.push(SegmentInfo::file_name(name));
        let mut field_infos = FieldInfos::new();
        field_infos.add("id", 0, true, false, DocValuesType::None);
        field_infos.add("val", 1, false, false, DocValuesType::Numeric);
        let info = SegmentInfo {
            name: name.to_string(),
            max_doc: vals.len() as u32,
            codec_name: codec.name().to_string(),
            codec_version: codec.format_version(),
            id: Uuid::new_v4(),
            diagnostics: BTreeMap::new(),
            field_infos,
            files,
            size_in_bytes: 0,
        };
        info.write(storage).unwrap();
        SegmentCommitInfo::new(Arc::new(info))
    }

    fn id(doc: usize) -> Term {
        Term::new("id", format!("doc-{doc}"))
    }

    fn update(doc: usize, value: i64) -> Arc<BufferedOp> {
        Arc::new(BufferedOp::Update(vec![DocValuesUpdate::numeric(id(doc), "val", Some(value))]))
    }

    fn delete(doc: usize) -> Arc<BufferedOp> {
        Arc::new(BufferedOp::DeleteTerm(id(doc)))
    }

    struct Fixture {
        storage: MemoryStorage,
        registry: CodecRegistry,
        infos: SegmentInfos,
        pool: ReaderPool,
        stream: BufferedUpdatesStream,
        policy: LogMergePolicy,
    }

    impl Fixture {
        fn new(vals: &[i64]) -> Self {
            let storage = MemoryStorage::new_default();
            let mut infos = SegmentInfos::new();
            infos.add(write_segment(&storage, &StandardCodec, "_0", vals));
            Fixture {
                storage,
                registry: CodecRegistry::default(),
                infos,
                pool: ReaderPool::new(),
                stream: BufferedUpdatesStream::new(),
                policy: LogMergePolicy::default(),
            }
        }

        fn apply(&mut self) -> Result<ApplyOutcome> {
            self.stream.apply_all(
                &self.storage,
                &self.registry,
                &mut self.infos,
                &mut self.pool,
                &self.policy,
            )
        }

        fn value(&self, doc: u32) -> Option<i64> {
            self.pool.entry("_0").and_then(|e| e.column("val")).and_then(|c| c.numeric(doc))
        }
    }

    #[test]
    fn test_empty_packets_take_no_generation() {
        let mut stream = BufferedUpdatesStream::new();
        assert_eq!(stream.push(Vec::new()), None);
        assert_eq!(stream.push(vec![delete(0)]), Some(1));
        assert_eq!(stream.next_gen(), 2);
    }

    #[test]
    fn test_delete_wins_over_update_in_same_packet() {
        let mut fx = Fixture::new(&[1, 2, 3]);
        fx.stream.push(vec![update(1, 10), delete(1), update(1, 20)]);
        let outcome = fx.apply().unwrap();
        assert_eq!(outcome.deleted_docs, 1);
        assert_eq!(outcome.updated_values, 0);
        assert!(!fx.pool.entry("_0").unwrap().is_live(1));
    }

    #[test]
    fn test_delete_wins_through_a_different_term() {
        let mut fx = Fixture::new(&[1, 2, 3]);
        let by_value = Arc::new(BufferedOp::DeleteQuery(Query::NumericRange {
            field: "val".to_string(),
            lower: Some(2),
            upper: Some(2),
        }));
        // the update would move doc 1 out of the range; the delete still sees 2
        fx.stream.push(vec![update(1, 7), by_value]);
        fx.apply().unwrap();
        let entry = fx.pool.entry("_0").unwrap();
        assert!(!entry.is_live(1));
        assert_eq!(entry.num_live(), 2);
    }

    #[test]
    fn test_later_update_wins() {
        let mut fx = Fixture::new(&[1, 2, 3]);
        fx.stream.push(vec![update(0, 5)]);
        fx.stream.push(vec![update(0, 6), update(0, 7)]);
        fx.apply().unwrap();
        assert_eq!(fx.value(0), Some(7));
        assert!(fx.stream.is_empty());
        assert_eq!(fx.infos.segments()[0].buffered_deletes_gen, 3);
    }

    #[test]
    fn test_unmatched_ops_change_nothing() {
        let mut fx = Fixture::new(&[1, 2]);
        fx.stream.push(vec![delete(9), update(9, 1)]);
        let outcome = fx.apply().unwrap();
        assert!(!outcome.any_changes());
        assert!(!fx.pool.has_pending_changes());
    }

    #[test]
    fn test_packets_skip_newer_segments() {
        let mut fx = Fixture::new(&[1]);
        fx.stream.push(vec![delete(0)]);
        let mut newer = write_segment(&fx.storage, &StandardCodec, "_1", &[1]);
        newer.buffered_deletes_gen = fx.stream.next_gen();
        fx.infos.add(newer);
        let outcome = fx.apply().unwrap();
        assert_eq!(outcome.dropped_segments, vec!["_0".to_string()]);
        assert_eq!(fx.infos.len(), 1);
        assert!(fx.infos.contains("_1"));
    }

    #[test]
    fn test_update_on_legacy_segment_is_rejected_then_dropped() {
        let mut fx = Fixture::new(&[1, 2]);
        fx.infos.add(write_segment(&fx.storage, &LegacyCodec, "_1", &[3]));
        fx.stream.push(vec![delete(1), update(0, 9)]);

        let err = fx.apply().unwrap_err();
        assert!(err.is_format_error());
        assert!(err.to_string().contains("_1.si"));
        assert!(fx.pool.entry("_0").is_none_or(|e| e.is_live(1)));

        // the delete survives the rejected update
        let outcome = fx.apply().unwrap();
        assert_eq!(outcome.deleted_docs, 1);
        assert_eq!(fx.value(0), Some(1));
    }

    #[test]
    fn test_unset_clears_value() {
        let mut fx = Fixture::new(&[4, 5]);
        fx.stream.push(vec![Arc::new(BufferedOp::Update(vec![DocValuesUpdate::numeric(
            id(0),
            "val",
            None,
        )]))]);
        fx.apply().unwrap();
        let column = fx.pool.entry("_0").unwrap().column("val").unwrap();
        assert!(!column.has_value(0));
        assert_eq!(column.docs_with_field(), 1);
        assert_eq!(column.value_at(1), Some(DocValue::Numeric(Some(5))));
    }
}
