//! Heap and two-tier garbage collector.
//!
//! Reclamation happens in two tiers. Deterministic reference counting frees
//! acyclic garbage the instant its count reaches zero; every assignment site
//! in the VM funnels through [`Heap::store`] so the counts stay exact. What
//! reference counting cannot reclaim is handled generationally: new objects
//! are appended to the current young chunk, a minor collection frees or
//! promotes a whole chunk when the ring wraps onto it, and a mark/sweep/
//! compact full collection reclaims the old generation when promotion finds
//! it at capacity.
//!
//! Objects never move; generations track slot indices, so handles stay valid
//! across promotion and compaction. A reclaimed slot bumps its generation,
//! which invalidates every outstanding [`Handle`] to it.

use std::mem;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::util::fast_map::fast_hash_map_new;
use crate::val::{FuncValue, Handle, ObjectData, ResourceValue, TableData, TableKey, Val};
use crate::vm::Fault;

const TRACE_TARGET: &str = "rill::gc";

/// Heap sizing knobs. Defaults match the runtime's stock build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapConfig {
    /// Objects per young-generation chunk.
    pub young_chunk_cap: usize,
    /// Number of chunks in the young ring.
    pub young_chunks: usize,
    /// Capacity of the old generation; promotion past this forces a full
    /// collection.
    pub old_cap: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            young_chunk_cap: 256,
            young_chunks: 4,
            old_cap: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapTag {
    Free,
    Str,
    Table,
    Object,
    Func,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Black,
}

/// Header shared by every heap object.
#[derive(Debug)]
pub struct GcHeader {
    pub size_bytes: u32,
    pub refs: u32,
    pub tag: HeapTag,
    color: Color,
}

pub enum HeapData {
    Free,
    Str(Arc<str>),
    Table(TableData),
    Object(ObjectData),
    Func(FuncValue),
    Resource(ResourceValue),
}

impl HeapData {
    fn tag(&self) -> HeapTag {
        match self {
            HeapData::Free => HeapTag::Free,
            HeapData::Str(_) => HeapTag::Str,
            HeapData::Table(_) => HeapTag::Table,
            HeapData::Object(_) => HeapTag::Object,
            HeapData::Func(_) => HeapTag::Func,
            HeapData::Resource(_) => HeapTag::Resource,
        }
    }

    /// Rough byte footprint for the header's accounting field.
    fn size_estimate(&self) -> u32 {
        let payload = match self {
            HeapData::Free => 0,
            HeapData::Str(s) => s.len(),
            HeapData::Table(t) => t.len() * 48,
            HeapData::Object(o) => o.type_name.len() + o.fields.len() * 56,
            HeapData::Func(_) => 16,
            HeapData::Resource(_) => 24,
        };
        (mem::size_of::<HeapSlot>() + payload) as u32
    }

    fn for_each_child(&self, mut f: impl FnMut(Val)) {
        match self {
            HeapData::Table(t) => {
                for v in t.values() {
                    f(*v);
                }
            }
            HeapData::Object(o) => {
                for v in o.fields.values() {
                    f(*v);
                }
            }
            _ => {}
        }
    }
}

struct HeapSlot {
    generation: u32,
    header: GcHeader,
    data: HeapData,
}

/// Borrowed view of everything a full collection must treat as a root: each
/// coroutine's live register slots, the global table, and the materialized
/// constants.
#[derive(Default)]
pub struct Roots<'a> {
    slices: Vec<&'a [Val]>,
    extra: Vec<Val>,
}

impl<'a> Roots<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_slice(&mut self, slots: &'a [Val]) {
        self.slices.push(slots);
    }

    pub fn add_val(&mut self, v: Val) {
        self.extra.push(v);
    }

    fn iter(&self) -> impl Iterator<Item = Val> + '_ {
        self.slices
            .iter()
            .flat_map(|s| s.iter().copied())
            .chain(self.extra.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub live_objects: u64,
    pub live_bytes: u64,
    pub minor_collections: u64,
    pub full_collections: u64,
    pub old_len: usize,
    pub free_len: usize,
}

pub struct Heap {
    slots: Vec<HeapSlot>,
    free: Vec<u32>,
    /// Young ring: fixed number of chunks of (slot index, generation).
    young: Vec<Vec<(u32, u32)>>,
    cur_chunk: usize,
    old: Vec<(u32, u32)>,
    cfg: HeapConfig,
    stats: HeapStats,
}

impl Heap {
    pub fn new(cfg: HeapConfig) -> Self {
        let chunks = cfg.young_chunks.max(1);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            young: (0..chunks).map(|_| Vec::with_capacity(cfg.young_chunk_cap)).collect(),
            cur_chunk: 0,
            old: Vec::new(),
            cfg,
            stats: HeapStats::default(),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut s = self.stats;
        s.old_len = self.old.len();
        s.free_len = self.free.len();
        s
    }

    // ---- resolution -----------------------------------------------------

    #[inline]
    fn slot(&self, h: Handle) -> Option<&HeapSlot> {
        let slot = self.slots.get(h.index as usize)?;
        (slot.generation == h.generation && slot.header.tag != HeapTag::Free).then_some(slot)
    }

    #[inline]
    fn slot_mut(&mut self, h: Handle) -> Option<&mut HeapSlot> {
        let slot = self.slots.get_mut(h.index as usize)?;
        (slot.generation == h.generation && slot.header.tag != HeapTag::Free).then_some(slot)
    }

    /// Resolve a handle to its payload; stale handles fail safely.
    #[inline]
    pub fn get(&self, h: Handle) -> Option<&HeapData> {
        self.slot(h).map(|s| &s.data)
    }

    pub fn header(&self, h: Handle) -> Option<&GcHeader> {
        self.slot(h).map(|s| &s.header)
    }

    pub fn refs(&self, h: Handle) -> Option<u32> {
        self.slot(h).map(|s| s.header.refs)
    }

    // ---- allocation -----------------------------------------------------

    pub fn alloc_str(&mut self, s: Arc<str>, roots: &Roots) -> Result<Handle, Fault> {
        self.alloc(HeapData::Str(s), roots)
    }

    pub fn alloc_table(&mut self, roots: &Roots) -> Result<Handle, Fault> {
        self.alloc(HeapData::Table(fast_hash_map_new()), roots)
    }

    pub fn alloc_object(&mut self, type_name: Arc<str>, roots: &Roots) -> Result<Handle, Fault> {
        self.alloc(
            HeapData::Object(ObjectData {
                type_name,
                fields: fast_hash_map_new(),
            }),
            roots,
        )
    }

    pub fn alloc_func(&mut self, f: FuncValue, roots: &Roots) -> Result<Handle, Fault> {
        self.alloc(HeapData::Func(f), roots)
    }

    pub fn alloc_resource(&mut self, r: ResourceValue, roots: &Roots) -> Result<Handle, Fault> {
        self.alloc(HeapData::Resource(r), roots)
    }

    fn alloc(&mut self, data: HeapData, roots: &Roots) -> Result<Handle, Fault> {
        if self.young[self.cur_chunk].len() >= self.cfg.young_chunk_cap {
            // Current chunk exhausted: rotate onto the next one, collecting
            // whatever it still holds from the previous lap.
            self.cur_chunk = (self.cur_chunk + 1) % self.young.len();
            self.minor_collect(self.cur_chunk, roots)?;
        }

        let tag = data.tag();
        let size = data.size_estimate();
        let header = GcHeader {
            size_bytes: size,
            refs: 0,
            tag,
            color: Color::White,
        };

        let index = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.header = header;
                slot.data = data;
                idx
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(HeapSlot { generation: 0, header, data });
                idx
            }
        };
        let generation = self.slots[index as usize].generation;
        self.young[self.cur_chunk].push((index, generation));
        self.stats.live_objects += 1;
        self.stats.live_bytes += size as u64;
        trace!(target: TRACE_TARGET, index, ?tag, size, "heap.alloc");
        Ok(Handle::new(index, generation))
    }

    // ---- reference counting --------------------------------------------

    #[inline]
    pub fn ref_add(&mut self, v: Val) {
        if let Some(h) = v.handle()
            && let Some(slot) = self.slot_mut(h)
        {
            slot.header.refs += 1;
        }
    }

    /// Decrement, releasing the object (and cascading into its children)
    /// when the count reaches zero.
    pub fn ref_del(&mut self, v: Val) {
        let Some(h) = v.handle() else { return };
        let mut work = vec![h];
        while let Some(h) = work.pop() {
            let Some(slot) = self.slot_mut(h) else { continue };
            slot.header.refs = slot.header.refs.saturating_sub(1);
            if slot.header.refs != 0 {
                continue;
            }
            let data = self.free_slot(h.index);
            data.for_each_child(|child| {
                if let Some(ch) = child.handle() {
                    work.push(ch);
                }
            });
        }
    }

    /// The single store primitive. Every write to a register, table slot,
    /// object field, global, or return-value slot goes through here so the
    /// reference counts never drift.
    #[inline]
    pub fn store(&mut self, dst: &mut Val, new: Val) {
        self.ref_add(new);
        let old = mem::replace(dst, new);
        self.ref_del(old);
    }

    /// Reclaim a slot: type becomes undefined, the generation bump kills
    /// outstanding handles, and the index returns to the free list.
    fn free_slot(&mut self, index: u32) -> HeapData {
        let slot = &mut self.slots[index as usize];
        let data = mem::replace(&mut slot.data, HeapData::Free);
        self.stats.live_bytes = self.stats.live_bytes.saturating_sub(slot.header.size_bytes as u64);
        self.stats.live_objects = self.stats.live_objects.saturating_sub(1);
        slot.header.tag = HeapTag::Free;
        slot.header.size_bytes = 0;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        data
    }

    // ---- table / object accessors --------------------------------------

    pub fn table_get(&self, table: Handle, key: &TableKey) -> Result<Val, Fault> {
        match self.get(table) {
            Some(HeapData::Table(map)) => Ok(map.get(key).copied().unwrap_or(Val::Nil)),
            Some(_) => Err(Fault::TypeError {
                op: "index",
                detail: "value is not an array".into(),
            }),
            None => Err(Fault::StaleHandle),
        }
    }

    pub fn table_set(&mut self, table: Handle, key: TableKey, val: Val) -> Result<(), Fault> {
        match self.get(table) {
            Some(HeapData::Table(_)) => {}
            Some(_) => {
                return Err(Fault::TypeError {
                    op: "index-assign",
                    detail: "value is not an array".into(),
                });
            }
            None => return Err(Fault::StaleHandle),
        }
        self.ref_add(val);
        let old = match self.slot_mut(table) {
            Some(HeapSlot {
                data: HeapData::Table(map),
                ..
            }) => map.insert(key, val),
            _ => None,
        };
        if let Some(old) = old {
            self.ref_del(old);
        }
        Ok(())
    }

    /// Append semantics for the map-backed array: key is the entry count.
    pub fn table_add(&mut self, table: Handle, val: Val) -> Result<(), Fault> {
        let next = match self.get(table) {
            Some(HeapData::Table(map)) => map.len() as i64,
            Some(_) => {
                return Err(Fault::TypeError {
                    op: "append",
                    detail: "value is not an array".into(),
                });
            }
            None => return Err(Fault::StaleHandle),
        };
        self.table_set(table, TableKey::Int(next), val)
    }

    pub fn table_len(&self, table: Handle) -> Result<i64, Fault> {
        match self.get(table) {
            Some(HeapData::Table(map)) => Ok(map.len() as i64),
            Some(_) => Err(Fault::TypeError {
                op: "len",
                detail: "value is not an array".into(),
            }),
            None => Err(Fault::StaleHandle),
        }
    }

    pub fn object_set(&mut self, obj: Handle, field: Arc<str>, val: Val) -> Result<(), Fault> {
        match self.get(obj) {
            Some(HeapData::Object(_)) => {}
            Some(_) => {
                return Err(Fault::TypeError {
                    op: "field-assign",
                    detail: "value is not an object".into(),
                });
            }
            None => return Err(Fault::StaleHandle),
        }
        self.ref_add(val);
        let old = match self.slot_mut(obj) {
            Some(HeapSlot {
                data: HeapData::Object(o),
                ..
            }) => o.fields.insert(field, val),
            _ => None,
        };
        if let Some(old) = old {
            self.ref_del(old);
        }
        Ok(())
    }

    // ---- equality & rendering ------------------------------------------

    /// Deep-enough equality for the EQ opcode: numbers compare across
    /// int/float, strings by content, other heap values by identity.
    pub fn vals_eq(&self, a: Val, b: Val) -> bool {
        match (a, b) {
            (Val::Int(x), Val::Float(y)) | (Val::Float(y), Val::Int(x)) => (x as f64) == y,
            (Val::Str(x), Val::Str(y)) => {
                if x == y {
                    return true;
                }
                match (self.get(x), self.get(y)) {
                    (Some(HeapData::Str(sx)), Some(HeapData::Str(sy))) => sx == sy,
                    _ => false,
                }
            }
            _ => a == b,
        }
    }

    pub fn str_content(&self, h: Handle) -> Option<&Arc<str>> {
        match self.get(h)? {
            HeapData::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Human-readable rendering used by ECHO and uncaught-error reporting.
    pub fn render(&self, v: Val) -> String {
        self.render_depth(v, 0)
    }

    fn render_depth(&self, v: Val, depth: usize) -> String {
        match v {
            Val::Nil => "nil".to_string(),
            Val::Int(i) => itoa::Buffer::new().format(i).to_string(),
            Val::Float(f) => ryu::Buffer::new().format(f).to_string(),
            Val::Bool(b) => b.to_string(),
            Val::Str(h) => match self.get(h) {
                Some(HeapData::Str(s)) => s.to_string(),
                _ => "<stale string>".to_string(),
            },
            Val::Table(h) => match self.get(h) {
                Some(HeapData::Table(map)) => {
                    if depth >= 3 {
                        return format!("[...{} entries]", map.len());
                    }
                    let mut parts: Vec<String> = map
                        .iter()
                        .map(|(k, val)| {
                            let key = match k {
                                TableKey::Int(i) => i.to_string(),
                                TableKey::Str(s) => s.to_string(),
                            };
                            format!("{}: {}", key, self.render_depth(*val, depth + 1))
                        })
                        .collect();
                    parts.sort();
                    format!("[{}]", parts.join(", "))
                }
                _ => "<stale array>".to_string(),
            },
            Val::Object(h) => match self.get(h) {
                Some(HeapData::Object(o)) => format!("<{} object>", o.type_name),
                _ => "<stale object>".to_string(),
            },
            Val::Func(h) => match self.get(h) {
                Some(HeapData::Func(FuncValue::Proto(p))) => format!("<fn #{}>", p),
                Some(HeapData::Func(FuncValue::Native(n))) => format!("<native {}>", n.name),
                _ => "<stale function>".to_string(),
            },
            Val::Resource(h) => match self.get(h) {
                Some(HeapData::Resource(r)) => format!("<{} #{}>", r.kind, r.id),
                _ => "<stale resource>".to_string(),
            },
        }
    }

    // ---- collection -----------------------------------------------------

    /// Minor collection over one young chunk: entries whose count dropped to
    /// zero are reclaimed; everything still referenced is promoted.
    fn minor_collect(&mut self, chunk: usize, roots: &Roots) -> Result<(), Fault> {
        let entries = mem::take(&mut self.young[chunk]);
        if entries.is_empty() {
            return Ok(());
        }
        self.stats.minor_collections += 1;
        let mut freed = 0usize;
        let mut promoted = 0usize;
        for (index, generation) in entries {
            let Some(slot) = self.slots.get(index as usize) else { continue };
            if slot.generation != generation || slot.header.tag == HeapTag::Free {
                // Reclaimed by refcounting (or already recycled) since it
                // was allocated; nothing to do.
                continue;
            }
            if slot.header.refs == 0 {
                let data = self.free_slot(index);
                let mut dead_children = Vec::new();
                data.for_each_child(|c| dead_children.push(c));
                for c in dead_children {
                    self.ref_del(c);
                }
                freed += 1;
            } else {
                if self.old.len() >= self.cfg.old_cap {
                    self.full_collect(roots);
                    if self.old.len() >= self.cfg.old_cap {
                        return Err(Fault::HeapExhausted {
                            old_cap: self.cfg.old_cap,
                        });
                    }
                }
                self.old.push((index, generation));
                promoted += 1;
            }
        }
        debug!(target: TRACE_TARGET, chunk, freed, promoted, "gc.minor");
        Ok(())
    }

    /// Full collection: mark from the roots, sweep unreachable slots in both
    /// generations, compact the old-generation index vector.
    pub fn full_collect(&mut self, roots: &Roots) {
        self.stats.full_collections += 1;

        // Mark.
        let mut work: Vec<Handle> = roots.iter().filter_map(|v| v.handle()).collect();
        while let Some(h) = work.pop() {
            let Some(slot) = self.slot_mut(h) else { continue };
            if slot.header.color == Color::Black {
                continue;
            }
            slot.header.color = Color::Black;
            slot.data.for_each_child(|child| {
                if let Some(ch) = child.handle() {
                    work.push(ch);
                }
            });
        }

        // Sweep. Dead objects may reference survivors; those counted edges
        // disappear with their owner, so drop the counts without cascading.
        let dead: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.header.tag != HeapTag::Free && s.header.color == Color::White)
            .map(|(i, _)| i as u32)
            .collect();
        let swept = dead.len();
        for index in dead {
            let data = self.free_slot(index);
            let mut survivors = Vec::new();
            data.for_each_child(|c| survivors.push(c));
            for child in survivors {
                if let Some(ch) = child.handle()
                    && let Some(slot) = self.slot_mut(ch)
                    && slot.header.color == Color::Black
                {
                    slot.header.refs = slot.header.refs.saturating_sub(1);
                }
            }
        }

        // Compact the generation lists and reset mark colors.
        let slots = &self.slots;
        let alive = |index: u32, generation: u32| {
            slots
                .get(index as usize)
                .is_some_and(|s| s.generation == generation && s.header.tag != HeapTag::Free)
        };
        self.old.retain(|&(i, g)| alive(i, g));
        for chunk in &mut self.young {
            chunk.retain(|&(i, g)| alive(i, g));
        }
        for slot in &mut self.slots {
            slot.header.color = Color::White;
        }
        debug!(
            target: TRACE_TARGET,
            swept,
            old_len = self.old.len(),
            "gc.full"
        );
    }
}
