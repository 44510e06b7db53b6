use crate::id::{Entity, Id};
use crate::index::{QueryId, TableId};
use crate::query::{CachedTable, Query, QueryFlags};
use crate::table::Table;
use crate::world::World;

/// All bits from position `k` upward.
#[inline]
fn bitmask_remain(k: usize) -> u64 { !0u64 << k }

#[inline]
fn bitmask(k: usize) -> u64 { 1u64 << k }

#[derive(Copy, Clone, Debug)]
struct PageCursor {
    first: usize,
    count: usize,
}

#[derive(Copy, Clone, Debug, Default)]
struct PageIter {
    offset: usize,
    limit: usize,
    remaining: usize,
}

enum PageResult {
    /// Limit reached; iteration terminates.
    Done,
    /// Nothing to emit from this frame; move on.
    Skip,
    Emit,
}

/// Consumes the page offset across whole frames first, then caps the frame
/// against the remaining limit.
fn page_iter_next(page: &mut PageIter, cur: &mut PageCursor) -> PageResult {
    if page.offset == 0 && page.limit == 0 {
        return if cur.count == 0 { PageResult::Skip } else { PageResult::Emit };
    }

    if page.offset > 0 {
        if page.offset > cur.count {
            page.offset -= cur.count;
            return PageResult::Skip;
        }
        cur.first += page.offset;
        cur.count -= page.offset;
        page.offset = 0;
    }

    if page.remaining > 0 {
        if page.remaining > cur.count {
            page.remaining -= cur.count;
        } else {
            cur.count = page.remaining;
            page.remaining = 0;
        }
    } else if page.limit > 0 {
        // Limit hit: no more entities left to iterate.
        return PageResult::Done;
    }

    if cur.count == 0 {
        PageResult::Skip
    } else {
        PageResult::Emit
    }
}

#[derive(Copy, Clone, Debug)]
struct Frame {
    /// Index of the cached table in the active list.
    slot: usize,
    table: TableId,
    first: usize,
    count: usize,
}

/// Streams the rows matched by a query, table by table.
///
/// Holding the iterator borrows the world exclusively, so structural
/// mutation during the iteration window is rejected at compile time; the
/// world is additionally flagged read-only for the duration.
pub struct QueryIter<'w> {
    world: &'w mut World,
    qid: QueryId,
    query: Option<Query>,
    page: PageIter,
    index: usize,
    bitset_first: usize,
    sparse_smallest: usize,
    sparse_first: usize,
    frame: Option<Frame>,
    frame_offset: usize,
    prev_count: usize,
    interrupted_by: Option<Entity>,
}

impl World {
    /// Starts iterating a query. Sorts pending tables, flushes component
    /// monitors and snapshots the change-detection baseline.
    pub fn query_iter(&mut self, qid: QueryId) -> QueryIter<'_> {
        self.query_iter_page(qid, 0, 0)
    }

    /// [`query_iter`](Self::query_iter) with paging: skip `offset` rows,
    /// emit at most `limit` (0 = unbounded).
    pub fn query_iter_page(&mut self, qid: QueryId, offset: usize, limit: usize) -> QueryIter<'_> {
        assert!(!self.query(qid).is_orphaned(), "query is orphaned");

        if self.query(qid).needs_reorder {
            let mut query = self.queries.take(qid);
            query.order_ranked_tables();
            self.queries.put_back(query);
        }

        self.sort_tables(qid);

        if self.query(qid).flags().contains(QueryFlags::HAS_REFS) {
            self.eval_monitors();
        }

        self.tables_reset_dirty(qid);

        let query = self.queries.take(qid);
        self.is_readonly = true;

        QueryIter {
            world: self,
            qid,
            query: Some(query),
            page: PageIter {
                offset,
                limit,
                remaining: limit,
            },
            index: 0,
            bitset_first: 0,
            sparse_smallest: 0,
            sparse_first: 0,
            frame: None,
            frame_offset: 0,
            prev_count: 0,
            interrupted_by: None,
        }
    }
}

impl<'w> Drop for QueryIter<'w> {
    fn drop(&mut self) {
        if let Some(query) = self.query.take() {
            self.world.queries.put_back(query);
        }
        self.world.is_readonly = false;
    }
}

impl<'w> QueryIter<'w> {
    fn cached(&self, slot: usize) -> &CachedTable { &self.query.as_ref().unwrap().tables[slot] }

    fn table(&self) -> &Table {
        let frame = self.frame.as_ref().expect("no current frame");
        self.world.store().table(frame.table)
    }

    /// Advances to the next non-empty run of rows. Returns `false` when the
    /// query is exhausted, its constraints are unsatisfied, or iteration was
    /// interrupted.
    pub fn next(&mut self) -> bool {
        if self.interrupted_by.is_some() {
            return false;
        }

        let query = self.query.as_ref().unwrap();
        if !query.constraints_satisfied {
            return false;
        }

        let use_slices = !query.table_slices.is_empty();
        let len = if use_slices {
            query.table_slices.len()
        } else {
            query.tables.len()
        };
        let prev_count = self.prev_count;

        while self.index < len {
            let i = self.index;
            self.index = i + 1;

            let query = self.query.as_ref().unwrap();
            let (slot, mut cur) = if use_slices {
                let slice = query.table_slices[i];
                (
                    slice.slot,
                    PageCursor {
                        first: slice.start_row,
                        count: slice.count,
                    },
                )
            } else {
                (i, PageCursor { first: 0, count: 0 })
            };

            let table = match query.tables[slot].table {
                Some(table) => table,
                None => continue,
            };

            if !use_slices {
                cur.count = self.world.store().table(table).count();
            }
            if cur.count == 0 {
                continue;
            }

            if !query.tables[slot].bitset_columns.is_empty() {
                match self.bitset_column_next(table, slot, &mut cur) {
                    None => {
                        // Exhausted the enabled runs for this table.
                        self.bitset_first = 0;
                        continue;
                    }
                    Some(()) => {
                        self.index = i;
                    }
                }
            }

            if !self.cached(slot).sparse_columns.is_empty() {
                match self.sparse_column_next(table, slot, &mut cur) {
                    None => continue,
                    Some(()) => {
                        self.index = i;
                    }
                }
            }

            match page_iter_next(&mut self.page, &mut cur) {
                PageResult::Done => return false,
                PageResult::Skip => continue,
                PageResult::Emit => {}
            }

            self.frame = Some(Frame {
                slot,
                table,
                first: cur.first,
                count: cur.count,
            });
            self.frame_offset += prev_count;
            self.prev_count = cur.count;

            if self
                .query
                .as_ref()
                .unwrap()
                .flags()
                .contains(QueryFlags::HAS_OUT_COLUMNS)
            {
                self.mark_columns_dirty(slot, table);
            }

            return true;
        }

        false
    }

    /// Narrows the cursor to the next contiguous run of rows enabled in
    /// every bitset column the query matched.
    fn bitset_column_next(
        &mut self,
        table: TableId,
        slot: usize,
        cur: &mut PageCursor,
    ) -> Option<()> {
        let query = self.query.as_ref().unwrap();
        let columns = &query.tables[slot].bitset_columns;
        let table = self.world.store().table(table);

        let mut first = self.bitset_first;
        let mut last = 0usize;

        let mut i = 0;
        while i < columns.len() {
            let bs = table.bitset_column(columns[i].bs_index);
            let bs_elem_count = bs.len();
            if bs_elem_count == 0 {
                return None;
            }
            let data = bs.blocks();
            let bs_block_count = ((bs_elem_count - 1) >> 6) + 1;
            let mut bs_block = first >> 6;
            if bs_block >= bs_block_count {
                return None;
            }

            let mut bs_start = first & 0x3F;

            // Find the first non-empty block.
            let mut v = data[bs_block];
            let mut remain = bitmask_remain(bs_start);
            while v & remain == 0 {
                bs_block += 1;
                if bs_block >= bs_block_count {
                    return None;
                }
                bs_start = 0;
                remain = !0u64;
                v = data[bs_block];
            }

            // First set bit in the block.
            while v & bitmask(bs_start) == 0 {
                bs_start += 1;
                debug_assert!(bs_start < 64);
            }

            // Extend the run of set bits.
            let mut bs_end = bs_start;
            let mut bs_block_end = bs_block;
            remain = bitmask_remain(bs_end);
            while v & remain == remain {
                bs_end = 0;
                bs_block_end += 1;
                if bs_block_end == bs_block_count {
                    break;
                }
                v = data[bs_block_end];
                remain = !0u64;
            }

            if bs_block_end != bs_block_count {
                while v & bitmask(bs_end) != 0 {
                    bs_end += 1;
                }
            }
            debug_assert!(bs_end < 64 || bs_block_end == bs_block_count);

            first = bs_block * 64 + bs_start;
            let mut cur_last = bs_block_end * 64 + bs_end;

            if first == cur_last {
                return None;
            }

            if i > 0 {
                // Each range must be a subset of the previous one; if it
                // starts past the previous end, restart the intersection.
                if first >= last {
                    i = 0;
                    continue;
                }
                if cur_last > last {
                    cur_last = last;
                }
            }

            last = cur_last;
            let mut elem_count = last - first;
            if elem_count > bs_elem_count {
                elem_count = bs_elem_count;
            }

            cur.first = first;
            cur.count = elem_count;
            self.bitset_first = first;

            i += 1;
        }

        self.bitset_first = last;
        Some(())
    }

    /// Iterates the switch column with the smallest target-case population,
    /// verifying candidates against every other switch term. Emits one row
    /// at a time.
    fn sparse_column_next(
        &mut self,
        table: TableId,
        slot: usize,
        cur: &mut PageCursor,
    ) -> Option<()> {
        let query = self.query.as_ref().unwrap();
        let columns = &query.tables[slot].sparse_columns;
        let table = self.world.store().table(table);

        let mut first_iteration = false;
        if self.sparse_smallest == 0 {
            let mut min = usize::MAX;
            let mut index = 0;
            for (i, column) in columns.iter().enumerate() {
                let count = table.switch_column(column.sw_index).case_count(column.case);
                if count < min {
                    min = count;
                    index = i + 1;
                }
            }
            self.sparse_smallest = index;
            first_iteration = true;
        }

        let smallest = self.sparse_smallest - 1;
        let column = columns[smallest];
        let sw = table.switch_column(column.sw_index);

        let mut first = if first_iteration {
            sw.first(column.case)
        } else {
            sw.next(self.sparse_first)
        };
        if first == -1 {
            self.sparse_smallest = 0;
            self.sparse_first = 0;
            return None;
        }

        // The candidate row must also hold the case of every other switch
        // term.
        'verify: loop {
            for (i, other) in columns.iter().enumerate() {
                if i == smallest {
                    continue;
                }
                let other_sw = table.switch_column(other.sw_index);
                if other_sw.get(first as usize) != other.case {
                    first = sw.next(first as usize);
                    if first == -1 {
                        self.sparse_smallest = 0;
                        self.sparse_first = 0;
                        return None;
                    }
                    continue 'verify;
                }
            }
            break;
        }

        cur.first = first as usize;
        cur.count = 1;
        self.sparse_first = first as usize;
        Some(())
    }

    fn mark_columns_dirty(&mut self, slot: usize, table: TableId) {
        let query = self.query.as_ref().unwrap();
        let terms = query.filter().terms();
        let ty = &query.tables[slot].ty;

        let mut dirty: smallvec::SmallVec<[usize; 8]> = smallvec::SmallVec::new();
        let column_count = self.world.store().table(table).column_count();

        let mut c = 0;
        let mut i = 0;
        while i < terms.len() {
            let term = &terms[i];
            let writable = match term.inout {
                crate::filter::InOut::In => false,
                crate::filter::InOut::Default => {
                    term.subj.entity == crate::id::THIS
                        && term.subj.set == crate::filter::SetMask::SELF
                }
                _ => true,
            };
            if writable {
                let column = ty.type_map[c];
                if column >= 0 && (column as usize) < column_count {
                    dirty.push(column as usize);
                }
            }

            if term.oper == crate::filter::Oper::Or {
                while i < terms.len() && terms[i].oper == crate::filter::Oper::Or {
                    i += 1;
                }
            } else {
                i += 1;
            }
            c += 1;
        }

        let table = self.world.store_mut().table_mut(table);
        for column in dirty {
            if table.column(column).size() > 0 {
                table.mark_dirty(column + 1);
            }
        }
    }

    /// Partitions the current frames between `total` workers, returning the
    /// share of worker `current`. Frames smaller than the worker count on a
    /// table-free query go to worker 0 whole.
    pub fn next_worker(&mut self, current: usize, total: usize) -> bool {
        assert!(total > 0 && current < total);

        let mut per_worker;
        let mut first;
        let prev_offset = self.frame.map_or(0, |f| f.first);

        loop {
            if !self.next() {
                return false;
            }

            let count = self.count();
            per_worker = count / total;
            first = per_worker * current;

            let rem = count - per_worker * total;
            if rem > 0 {
                if current < rem {
                    per_worker += 1;
                    first += current;
                } else {
                    first += rem;
                }
            }

            if per_worker == 0
                && !self
                    .query
                    .as_ref()
                    .unwrap()
                    .flags()
                    .contains(QueryFlags::NEEDS_TABLES)
            {
                return current == 0;
            }

            if per_worker > 0 {
                break;
            }
        }

        self.frame_offset -= prev_offset;
        let frame = self.frame.as_mut().unwrap();
        frame.first += first;
        frame.count = per_worker;
        self.frame_offset += first;
        self.prev_count = per_worker;

        true
    }

    /// Entities of the current frame.
    pub fn entities(&self) -> &[Entity] {
        let frame = self.frame.as_ref().expect("no current frame");
        &self.table().entities()[frame.first..frame.first + frame.count]
    }

    /// Number of rows in the current frame.
    pub fn count(&self) -> usize { self.frame.map_or(0, |f| f.count) }

    /// First row of the current frame within its table.
    pub fn offset(&self) -> usize { self.frame.map_or(0, |f| f.first) }

    /// Rows emitted before the current frame.
    pub fn frame_offset(&self) -> usize { self.frame_offset }

    pub fn table_id(&self) -> TableId { self.frame.as_ref().expect("no current frame").table }

    /// Number of term slots (contiguous `Or` groups collapse into one).
    pub fn term_count(&self) -> usize {
        self.query.as_ref().unwrap().filter().term_count_actual()
    }

    /// Concrete id matched for a term slot.
    pub fn term_id(&self, slot: usize) -> Id {
        let frame = self.frame.as_ref().expect("no current frame");
        self.cached(frame.slot).ty.ids[slot]
    }

    /// Entity a term resolved on; `NULL` means the row entity itself.
    pub fn term_subject(&self, slot: usize) -> Entity {
        let frame = self.frame.as_ref().expect("no current frame");
        self.cached(frame.slot).ty.subjects[slot]
    }

    pub fn term_size(&self, slot: usize) -> usize {
        let frame = self.frame.as_ref().expect("no current frame");
        self.cached(frame.slot).ty.sizes[slot]
    }

    /// Column index of a term inside the table, -1 when absent or shared.
    pub fn term_column(&self, slot: usize) -> i32 {
        let frame = self.frame.as_ref().expect("no current frame");
        self.cached(frame.slot).ty.type_map[slot]
    }

    /// The rows of a term's column covered by this frame, or `None` when the
    /// term carries no table data (tag, absent, or shared).
    pub fn column(&self, slot: usize) -> Option<&[u8]> {
        let frame = self.frame.as_ref().expect("no current frame");
        let ty = &self.cached(frame.slot).ty;
        let column = ty.type_map[slot];
        if column < 0 {
            return None;
        }
        let table = self.table();
        let column = column as usize;
        if column >= table.column_count() {
            return None;
        }
        let size = table.column(column).size();
        if size == 0 {
            return None;
        }
        let bytes = table.column(column).bytes();
        Some(&bytes[frame.first * size..(frame.first + frame.count) * size])
    }

    /// Shared data for a term satisfied by another entity (a reference).
    pub fn reference(&self, slot: usize) -> Option<&[u8]> {
        let frame = self.frame.as_ref().expect("no current frame");
        let ty = &self.cached(frame.slot).ty;
        let subject = ty.subjects[slot];
        if subject.is_null() {
            return None;
        }
        self.world.get(subject, ty.ids[slot])
    }

    /// Interrupts iteration; subsequent `next` calls return `false`.
    pub fn set_interrupted(&mut self, by: Entity) { self.interrupted_by = Some(by); }

    pub fn interrupted_by(&self) -> Option<Entity> { self.interrupted_by }

    pub fn query_id(&self) -> QueryId { self.qid }
}
