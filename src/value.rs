//! The Value Copier (spec §4.2, §9): deep-copy of a caller-owned value
//! graph into pool-backed shared-memory bytes (`copy_in`, called by
//! `store`) and back out into caller-owned memory (`copy_out`, called by
//! `fetch`).
//!
//! `Value` is the language-neutral tagged union from spec §9's design
//! notes, made concrete. `Seq`/`Map`/`Ref` are `Rc`-wrapped so the same
//! identity-map trick spec §4.2 describes — "look up the source address;
//! if present, bump the destination's refcount and return the existing
//! destination... insert the mapping before recursing" — works the same
//! way on the way in (keyed by `Rc` pointer) and on the way out (keyed by
//! pool offset).
//!
//! The pool-side encoding is a small tagged binary format (`pool_codec`
//! below): every node starts with a one-byte tag, containers store
//! offsets to their children rather than embedding them, and the encoder
//! writes a container's own header *before* recursing into children so a
//! cycle back to that container resolves to an already-valid offset.
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::pool::Pool;

/// Tag for an [`Value::Opaque`] payload: was it originally an array or an
/// object on the caller's side? Only meaningful when a serializer is
/// configured (spec §4.2: "arrays ... when a serializer is configured").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpaqueKind {
    Object,
    Array,
}

/// Caller-side value graph.
///
/// `Seq`/`Map`/`Ref` are the three refcounted node kinds that participate
/// in the identity map during copy (spec §4.2); everything else is a pure
/// scalar, memcpy'd and never deduplicated.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
    Bytes(Vec<u8>),
    Seq(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<Vec<(Value, Value)>>>),
    Ref(Rc<RefCell<Value>>),
    /// A value whose bytes are opaque to the copier: either produced by
    /// the serializer boundary (composite values under a configured
    /// serializer) or handed to us already encoded by the caller.
    Opaque { kind: OpaqueKind, bytes: Vec<u8> },
}

impl Value {
    pub fn seq(items: Vec<Value>) -> Value {
        Value::Seq(Rc::new(RefCell::new(items)))
    }

    pub fn map(pairs: Vec<(Value, Value)>) -> Value {
        Value::Map(Rc::new(RefCell::new(pairs)))
    }

    pub fn reference(inner: Value) -> Value {
        Value::Ref(Rc::new(RefCell::new(inner)))
    }

    /// Spec §4.2: "A top-level element that is itself a single-owner
    /// reference cell pointing to a non-recursive payload is transparently
    /// unwrapped to its payload." Called once, at the root, before
    /// `copy_in`.
    pub fn unwrap_single_owner_ref(self) -> Value {
        match self {
            Value::Ref(rc) if Rc::strong_count(&rc) == 1 => {
                let inner = rc.borrow().clone();
                if is_recursive(&inner, &rc) {
                    Value::Ref(rc)
                } else {
                    inner
                }
            }
            other => other,
        }
    }
}

/// True if `inner` (the payload of `outer_rc`) reaches `outer_rc` itself —
/// unwrapping a self-referential ref cell would lose the cycle, so it is
/// left wrapped.
fn is_recursive(inner: &Value, outer_rc: &Rc<RefCell<Value>>) -> bool {
    let target = Rc::as_ptr(outer_rc) as usize;
    let mut seen = HashSet::new();
    fn walk(v: &Value, target: usize, seen: &mut HashSet<usize>) -> bool {
        match v {
            Value::Ref(rc) => {
                let p = Rc::as_ptr(rc) as usize;
                if p == target {
                    return true;
                }
                if !seen.insert(p) {
                    return false;
                }
                walk(&rc.borrow(), target, seen)
            }
            Value::Seq(rc) => {
                let p = Rc::as_ptr(rc) as usize;
                if !seen.insert(p) {
                    return false;
                }
                rc.borrow().iter().any(|e| walk(e, target, seen))
            }
            Value::Map(rc) => {
                let p = Rc::as_ptr(rc) as usize;
                if !seen.insert(p) {
                    return false;
                }
                rc.borrow().iter().any(|(k, v)| walk(k, target, seen) || walk(v, target, seen))
            }
            _ => false,
        }
    }
    walk(inner, target, &mut seen)
}

/// `encode(value) -> bytes` / `decode(bytes) -> value` boundary (spec §1,
/// §4.2). The default is `TextSerializer`, a self-describing text codec;
/// consumers may plug in anything implementing this trait.
pub trait Serializer: Send + Sync {
    fn encode(&self, value: &Value) -> Option<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Option<Value>;
}

/// A simple self-describing text encoder: the default serializer when
/// none is configured by the caller (spec §1: "default is a language-value
/// text encoder"). Not meant to be fast; meant to always round-trip.
pub struct TextSerializer;

impl Serializer for TextSerializer {
    fn encode(&self, value: &Value) -> Option<Vec<u8>> {
        let mut out = String::new();
        let mut seen = HashMap::new();
        write_text(value, &mut out, &mut seen);
        Some(out.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Option<Value> {
        let s = std::str::from_utf8(bytes).ok()?;
        let mut chars = s.chars().peekable();
        let mut seen = HashMap::new();
        let v = read_text(&mut chars, &mut seen)?;
        if chars.peek().is_some() {
            return None;
        }
        Some(v)
    }
}

/// Write `value` as self-describing text. `Seq`/`Map`/`Ref` — the three
/// refcounted node kinds — carry an explicit id the first time they're
/// written (`a:<id>:<count>:{...}`) and a bare backreference (`R:<id>;`)
/// on every later encounter of the same `Rc` pointer, keyed by `seen`.
/// Without this a self-referential value (`a = [a]`) would make
/// `write_text` recurse forever (spec §4.2: "Cycles: preserved; must not
/// recurse infinitely" — not scoped to the no-serializer path).
fn write_text(value: &Value, out: &mut String, seen: &mut HashMap<usize, u32>) {
    match value {
        Value::Null => out.push_str("N;"),
        Value::Bool(b) => out.push_str(if *b { "b:1;" } else { "b:0;" }),
        Value::Int(i) => out.push_str(&format!("i:{i};")),
        Value::Float(f) => out.push_str(&format!("d:{f};")),
        Value::Str(s) => {
            out.push_str(&format!("s:{}:\"", s.len()));
            for b in s {
                if *b == b'"' || *b == b'\\' {
                    out.push('\\');
                }
                out.push(*b as char);
            }
            out.push_str("\";");
        }
        Value::Bytes(b) => {
            out.push_str(&format!("x:{}:", b.len()));
            for byte in b {
                out.push_str(&format!("{byte:02x}"));
            }
            out.push(';');
        }
        Value::Seq(rc) => {
            let ptr = Rc::as_ptr(rc) as usize;
            if let Some(&id) = seen.get(&ptr) {
                out.push_str(&format!("R:{id};"));
                return;
            }
            let id = seen.len() as u32;
            seen.insert(ptr, id);
            let items = rc.borrow();
            out.push_str(&format!("a:{id}:{}:{{", items.len()));
            for item in items.iter() {
                write_text(item, out, seen);
            }
            out.push('}');
        }
        Value::Map(rc) => {
            let ptr = Rc::as_ptr(rc) as usize;
            if let Some(&id) = seen.get(&ptr) {
                out.push_str(&format!("R:{id};"));
                return;
            }
            let id = seen.len() as u32;
            seen.insert(ptr, id);
            let pairs = rc.borrow();
            out.push_str(&format!("m:{id}:{}:{{", pairs.len()));
            for (k, v) in pairs.iter() {
                write_text(k, out, seen);
                write_text(v, out, seen);
            }
            out.push('}');
        }
        Value::Ref(rc) => {
            let ptr = Rc::as_ptr(rc) as usize;
            if let Some(&id) = seen.get(&ptr) {
                out.push_str(&format!("R:{id};"));
                return;
            }
            let id = seen.len() as u32;
            seen.insert(ptr, id);
            out.push_str(&format!("r:{id}:"));
            write_text(&rc.borrow(), out, seen);
        }
        Value::Opaque { kind, bytes } => {
            let k = match kind {
                OpaqueKind::Object => 'O',
                OpaqueKind::Array => 'A',
            };
            out.push_str(&format!("{k}:{}:", bytes.len()));
            for byte in bytes {
                out.push_str(&format!("{byte:02x}"));
            }
            out.push(';');
        }
    }
}

/// Inverse of [`write_text`]. `seen` maps an id (assigned in encounter
/// order by the writer) to the already-reconstructed `Value` — for
/// `Seq`/`Map` this is registered *before* their elements are parsed, so
/// an `R:<id>;` backreference encountered while still parsing a
/// container's own elements (the `a=[a]` case) resolves to the same `Rc`
/// rather than recursing into `read_text` again.
fn read_text(chars: &mut std::iter::Peekable<std::str::Chars>, seen: &mut HashMap<u32, Value>) -> Option<Value> {
    let tag = *chars.peek()?;
    match tag {
        'N' => {
            chars.next();
            expect(chars, ';')?;
            Some(Value::Null)
        }
        'b' => {
            chars.next();
            expect(chars, ':')?;
            let c = chars.next()?;
            expect(chars, ';')?;
            Some(Value::Bool(c == '1'))
        }
        'i' => {
            chars.next();
            expect(chars, ':')?;
            let digits = take_until(chars, ';')?;
            Some(Value::Int(digits.parse().ok()?))
        }
        'd' => {
            chars.next();
            expect(chars, ':')?;
            let digits = take_until(chars, ';')?;
            Some(Value::Float(digits.parse().ok()?))
        }
        's' => {
            chars.next();
            expect(chars, ':')?;
            let len: usize = take_until(chars, ':')?.parse().ok()?;
            expect(chars, '"')?;
            let mut bytes = Vec::with_capacity(len);
            while bytes.len() < len {
                let c = chars.next()?;
                let c = if c == '\\' { chars.next()? } else { c };
                bytes.push(c as u8);
            }
            expect(chars, '"')?;
            expect(chars, ';')?;
            Some(Value::Str(bytes))
        }
        'x' | 'O' | 'A' => {
            chars.next();
            expect(chars, ':')?;
            let len: usize = take_until(chars, ':')?.parse().ok()?;
            let mut bytes = Vec::with_capacity(len);
            for _ in 0..len {
                let hi = chars.next()?.to_digit(16)?;
                let lo = chars.next()?.to_digit(16)?;
                bytes.push(((hi << 4) | lo) as u8);
            }
            expect(chars, ';')?;
            Some(match tag {
                'x' => Value::Bytes(bytes),
                'O' => Value::Opaque { kind: OpaqueKind::Object, bytes },
                _ => Value::Opaque { kind: OpaqueKind::Array, bytes },
            })
        }
        'R' => {
            chars.next();
            expect(chars, ':')?;
            let id: u32 = take_until(chars, ';')?.parse().ok()?;
            seen.get(&id).cloned()
        }
        'a' => {
            chars.next();
            expect(chars, ':')?;
            let id: u32 = take_until(chars, ':')?.parse().ok()?;
            let count: usize = take_until(chars, ':')?.parse().ok()?;
            expect(chars, '{')?;
            let rc = Rc::new(RefCell::new(Vec::with_capacity(count)));
            seen.insert(id, Value::Seq(rc.clone()));
            for _ in 0..count {
                let item = read_text(chars, seen)?;
                rc.borrow_mut().push(item);
            }
            expect(chars, '}')?;
            Some(Value::Seq(rc))
        }
        'm' => {
            chars.next();
            expect(chars, ':')?;
            let id: u32 = take_until(chars, ':')?.parse().ok()?;
            let count: usize = take_until(chars, ':')?.parse().ok()?;
            expect(chars, '{')?;
            let rc = Rc::new(RefCell::new(Vec::with_capacity(count)));
            seen.insert(id, Value::Map(rc.clone()));
            for _ in 0..count {
                let k = read_text(chars, seen)?;
                let v = read_text(chars, seen)?;
                rc.borrow_mut().push((k, v));
            }
            expect(chars, '}')?;
            Some(Value::Map(rc))
        }
        'r' => {
            chars.next();
            expect(chars, ':')?;
            let id: u32 = take_until(chars, ':')?.parse().ok()?;
            let rc = Rc::new(RefCell::new(Value::Null));
            seen.insert(id, Value::Ref(rc.clone()));
            let inner = read_text(chars, seen)?;
            *rc.borrow_mut() = inner;
            Some(Value::Ref(rc))
        }
        _ => None,
    }
}

fn expect(chars: &mut std::iter::Peekable<std::str::Chars>, want: char) -> Option<()> {
    if chars.next()? == want {
        Some(())
    } else {
        None
    }
}

fn take_until(chars: &mut std::iter::Peekable<std::str::Chars>, stop: char) -> Option<String> {
    let mut s = String::new();
    loop {
        let c = chars.next()?;
        if c == stop {
            return Some(s);
        }
        s.push(c);
    }
}

/// Pool-relative binary encoding used by [`copy_in`]/[`copy_out`].
mod pool_codec {
    pub const TAG_NULL: u8 = 0;
    pub const TAG_BOOL: u8 = 1;
    pub const TAG_INT: u8 = 2;
    pub const TAG_FLOAT: u8 = 3;
    pub const TAG_STR: u8 = 4;
    pub const TAG_BYTES: u8 = 5;
    pub const TAG_SEQ: u8 = 6;
    pub const TAG_MAP: u8 = 7;
    pub const TAG_REFCELL: u8 = 8;
    pub const TAG_OPAQUE: u8 = 9;
    pub const TAG_ALIAS: u8 = 10;

    pub const SEQ_HEADER_SIZE: usize = 1 + 4 + 4; // tag, count, items_offset
    pub const MAP_HEADER_SIZE: usize = 1 + 4 + 4; // tag, count, items_offset
    pub const REFCELL_SIZE: usize = 1 + 4; // tag, target_offset
    pub const ALIAS_SIZE: usize = 1 + 4; // tag, target_offset
}
use pool_codec::*;

unsafe fn put_u8(pool: &Pool, off: usize, v: u8) {
    pool.write(off, &[v]);
}
unsafe fn put_u32(pool: &Pool, off: usize, v: u32) {
    pool.write(off, &v.to_le_bytes());
}
unsafe fn put_i64(pool: &Pool, off: usize, v: i64) {
    pool.write(off, &v.to_le_bytes());
}
unsafe fn put_f64(pool: &Pool, off: usize, v: f64) {
    pool.write(off, &v.to_le_bytes());
}
unsafe fn get_u8(pool: &Pool, off: usize) -> u8 {
    pool.read(off, 1)[0]
}
unsafe fn get_u32(pool: &Pool, off: usize) -> u32 {
    u32::from_le_bytes(pool.read(off, 4).try_into().unwrap())
}
unsafe fn get_i64(pool: &Pool, off: usize) -> i64 {
    i64::from_le_bytes(pool.read(off, 8).try_into().unwrap())
}
unsafe fn get_f64(pool: &Pool, off: usize) -> f64 {
    f64::from_le_bytes(pool.read(off, 8).try_into().unwrap())
}

/// Exact byte count `copy_in` would need to encode `value`, computed by
/// walking the same identity-map/dedup rules `copy_in` uses, without
/// touching any pool. Used to size an entry's `Pool` up front (spec §4.3
/// step 2 requires the allocation to either wholly succeed or wholly
/// fail; an exact-size allocation makes that atomic).
///
/// Returns `None` if a configured serializer fails to encode a composite
/// value (spec §7 Codec error) — the caller should abort the store before
/// ever touching the `Sma`.
pub fn encoded_size(value: &Value, serializer: Option<&dyn Serializer>) -> Option<usize> {
    let mut visited = HashSet::new();
    encoded_size_inner(value, &mut visited, serializer)
}

fn encoded_size_inner(value: &Value, visited: &mut HashSet<usize>, serializer: Option<&dyn Serializer>) -> Option<usize> {
    match value {
        Value::Null => Some(1),
        Value::Bool(_) => Some(2),
        Value::Int(_) => Some(9),
        Value::Float(_) => Some(9),
        Value::Str(s) => Some(5 + s.len()),
        Value::Bytes(b) => Some(5 + b.len()),
        Value::Seq(rc) => {
            let key = Rc::as_ptr(rc) as usize;
            if visited.contains(&key) {
                return Some(ALIAS_SIZE);
            }
            // Inserted before encoding (not just before recursing into
            // children) so a second reference to this same `Rc` becomes an
            // alias rather than being serialized a second time; `write_text`
            // itself is independently cycle-safe (see its own id/backref
            // scheme), so this ordering is about dedup, not recursion safety.
            visited.insert(key);
            if let Some(s) = serializer {
                let enc = s.encode(value)?;
                return Some(1 + 1 + 4 + enc.len());
            }
            let items = rc.borrow();
            let mut total = SEQ_HEADER_SIZE + items.len() * 4;
            for item in items.iter() {
                total += encoded_size_inner(item, visited, serializer)?;
            }
            Some(total)
        }
        Value::Map(rc) => {
            let key = Rc::as_ptr(rc) as usize;
            if visited.contains(&key) {
                return Some(ALIAS_SIZE);
            }
            visited.insert(key);
            if let Some(s) = serializer {
                let enc = s.encode(value)?;
                return Some(1 + 1 + 4 + enc.len());
            }
            let pairs = rc.borrow();
            let mut total = MAP_HEADER_SIZE + pairs.len() * 8;
            for (k, v) in pairs.iter() {
                total += encoded_size_inner(k, visited, serializer)?;
                total += encoded_size_inner(v, visited, serializer)?;
            }
            Some(total)
        }
        Value::Ref(rc) => {
            let key = Rc::as_ptr(rc) as usize;
            if visited.contains(&key) {
                return Some(ALIAS_SIZE);
            }
            visited.insert(key);
            Some(REFCELL_SIZE + encoded_size_inner(&rc.borrow(), visited, serializer)?)
        }
        Value::Opaque { bytes, .. } => Some(1 + 1 + 4 + bytes.len()),
    }
}

/// Deep-copy `value` into `pool`, returning the pool-relative offset of
/// the root node. Shared subobjects and cycles are preserved via an
/// identity map from source `Rc` address to destination pool offset,
/// populated *before* recursing into a container's children (spec §4.2).
///
/// `pool` must have been sized by a prior call to [`encoded_size`] with
/// the same `value` and `serializer`; a `None` return here means the pool
/// ran out of room, which should not happen if sizing was correct, or a
/// serializer encode failed on a composite node reached only during the
/// walk (not possible if `encoded_size` already validated the same path).
pub fn copy_in(value: &Value, pool: &Pool, serializer: Option<&dyn Serializer>) -> Option<usize> {
    let mut id_map = HashMap::new();
    copy_in_node(value, pool, &mut id_map, serializer)
}

fn copy_in_node(
    value: &Value,
    pool: &Pool,
    id_map: &mut HashMap<usize, usize>,
    serializer: Option<&dyn Serializer>,
) -> Option<usize> {
    match value {
        Value::Null => {
            let off = pool.reserve(1)?;
            unsafe { put_u8(pool, off, TAG_NULL) };
            Some(off)
        }
        Value::Bool(b) => {
            let off = pool.reserve(2)?;
            unsafe {
                put_u8(pool, off, TAG_BOOL);
                put_u8(pool, off + 1, *b as u8);
            }
            Some(off)
        }
        Value::Int(i) => {
            let off = pool.reserve(9)?;
            unsafe {
                put_u8(pool, off, TAG_INT);
                put_i64(pool, off + 1, *i);
            }
            Some(off)
        }
        Value::Float(f) => {
            let off = pool.reserve(9)?;
            unsafe {
                put_u8(pool, off, TAG_FLOAT);
                put_f64(pool, off + 1, *f);
            }
            Some(off)
        }
        Value::Str(s) => write_bytes_node(pool, TAG_STR, s),
        Value::Bytes(b) => write_bytes_node(pool, TAG_BYTES, b),
        Value::Seq(rc) => {
            let key = Rc::as_ptr(rc) as usize;
            if let Some(&existing) = id_map.get(&key) {
                return write_alias(pool, existing);
            }
            if let Some(s) = serializer {
                // `s.encode` (→ `write_text` for the default serializer) is
                // itself cycle-safe via its own id/backreference scheme, so
                // this can't recurse forever even though `key` isn't in
                // `id_map` yet. Registered right after so a second
                // reference to this same `Rc` becomes an alias to the
                // opaque blob instead of being serialized again.
                let enc = s.encode(value)?;
                let off = write_opaque_node(pool, OpaqueKind::Array, &enc)?;
                id_map.insert(key, off);
                return Some(off);
            }
            let header_off = pool.reserve(SEQ_HEADER_SIZE)?;
            id_map.insert(key, header_off);
            let items = rc.borrow();
            let mut child_offsets = Vec::with_capacity(items.len());
            for item in items.iter() {
                child_offsets.push(copy_in_node(item, pool, id_map, serializer)? as u32);
            }
            let items_off = if child_offsets.is_empty() {
                0
            } else {
                let table_off = pool.reserve(4 * child_offsets.len())?;
                unsafe {
                    for (i, off) in child_offsets.iter().enumerate() {
                        put_u32(pool, table_off + i * 4, *off);
                    }
                }
                table_off as u32
            };
            unsafe {
                put_u8(pool, header_off, TAG_SEQ);
                put_u32(pool, header_off + 1, child_offsets.len() as u32);
                put_u32(pool, header_off + 5, items_off);
            }
            Some(header_off)
        }
        Value::Map(rc) => {
            let key = Rc::as_ptr(rc) as usize;
            if let Some(&existing) = id_map.get(&key) {
                return write_alias(pool, existing);
            }
            if let Some(s) = serializer {
                let enc = s.encode(value)?;
                let off = write_opaque_node(pool, OpaqueKind::Object, &enc)?;
                id_map.insert(key, off);
                return Some(off);
            }
            let header_off = pool.reserve(MAP_HEADER_SIZE)?;
            id_map.insert(key, header_off);
            let pairs = rc.borrow();
            let mut child_offsets = Vec::with_capacity(pairs.len() * 2);
            for (k, v) in pairs.iter() {
                child_offsets.push(copy_in_node(k, pool, id_map, serializer)? as u32);
                child_offsets.push(copy_in_node(v, pool, id_map, serializer)? as u32);
            }
            let items_off = if child_offsets.is_empty() {
                0
            } else {
                let table_off = pool.reserve(4 * child_offsets.len())?;
                unsafe {
                    for (i, off) in child_offsets.iter().enumerate() {
                        put_u32(pool, table_off + i * 4, *off);
                    }
                }
                table_off as u32
            };
            unsafe {
                put_u8(pool, header_off, TAG_MAP);
                put_u32(pool, header_off + 1, pairs.len() as u32);
                put_u32(pool, header_off + 5, items_off);
            }
            Some(header_off)
        }
        Value::Ref(rc) => {
            let key = Rc::as_ptr(rc) as usize;
            if let Some(&existing) = id_map.get(&key) {
                return write_alias(pool, existing);
            }
            let header_off = pool.reserve(REFCELL_SIZE)?;
            id_map.insert(key, header_off);
            let target_off = copy_in_node(&rc.borrow(), pool, id_map, serializer)? as u32;
            unsafe {
                put_u8(pool, header_off, TAG_REFCELL);
                put_u32(pool, header_off + 1, target_off);
            }
            Some(header_off)
        }
        Value::Opaque { kind, bytes } => write_opaque_node(pool, *kind, bytes),
    }
}

fn write_bytes_node(pool: &Pool, tag: u8, bytes: &[u8]) -> Option<usize> {
    let off = pool.reserve(5 + bytes.len())?;
    unsafe {
        put_u8(pool, off, tag);
        put_u32(pool, off + 1, bytes.len() as u32);
        pool.write(off + 5, bytes);
    }
    Some(off)
}

fn write_opaque_node(pool: &Pool, kind: OpaqueKind, bytes: &[u8]) -> Option<usize> {
    let off = pool.reserve(1 + 1 + 4 + bytes.len())?;
    unsafe {
        put_u8(pool, off, TAG_OPAQUE);
        put_u8(pool, off + 1, kind as u8);
        put_u32(pool, off + 2, bytes.len() as u32);
        pool.write(off + 6, bytes);
    }
    Some(off)
}

fn write_alias(pool: &Pool, target: usize) -> Option<usize> {
    let off = pool.reserve(ALIAS_SIZE)?;
    unsafe {
        put_u8(pool, off, TAG_ALIAS);
        put_u32(pool, off + 1, target as u32);
    }
    Some(off)
}

/// Deep-copy the value graph rooted at pool-relative `offset` back into
/// caller-owned memory. Returns the reconstructed value and whether every
/// node decoded cleanly; a decode failure at a serializer-backed node
/// yields `Value::Null` for that node (spec §7 Codec error) and `false`
/// for the whole call, matching `fetch`'s "writes a null-typed value and
/// returns false" contract.
pub fn copy_out(offset: usize, pool: &Pool, serializer: Option<&dyn Serializer>) -> (Value, bool) {
    let mut id_map: HashMap<usize, Value> = HashMap::new();
    copy_out_node(offset, pool, &mut id_map, serializer)
}

fn copy_out_node(
    offset: usize,
    pool: &Pool,
    id_map: &mut HashMap<usize, Value>,
    serializer: Option<&dyn Serializer>,
) -> (Value, bool) {
    let tag = unsafe { get_u8(pool, offset) };
    match tag {
        TAG_NULL => (Value::Null, true),
        TAG_BOOL => (Value::Bool(unsafe { get_u8(pool, offset + 1) } != 0), true),
        TAG_INT => (Value::Int(unsafe { get_i64(pool, offset + 1) }), true),
        TAG_FLOAT => (Value::Float(unsafe { get_f64(pool, offset + 1) }), true),
        TAG_STR => {
            let len = unsafe { get_u32(pool, offset + 1) } as usize;
            let bytes = unsafe { pool.read(offset + 5, len) }.to_vec();
            (Value::Str(bytes), true)
        }
        TAG_BYTES => {
            let len = unsafe { get_u32(pool, offset + 1) } as usize;
            let bytes = unsafe { pool.read(offset + 5, len) }.to_vec();
            (Value::Bytes(bytes), true)
        }
        TAG_SEQ => {
            if let Some(existing) = id_map.get(&offset) {
                return (existing.clone(), true);
            }
            let count = unsafe { get_u32(pool, offset + 1) } as usize;
            let items_off = unsafe { get_u32(pool, offset + 5) } as usize;
            let rc = Rc::new(RefCell::new(Vec::with_capacity(count)));
            id_map.insert(offset, Value::Seq(rc.clone()));
            let mut ok = true;
            for i in 0..count {
                let child_off = unsafe { get_u32(pool, items_off + i * 4) } as usize;
                let (v, o) = copy_out_node(child_off, pool, id_map, serializer);
                ok &= o;
                rc.borrow_mut().push(v);
            }
            (Value::Seq(rc), ok)
        }
        TAG_MAP => {
            if let Some(existing) = id_map.get(&offset) {
                return (existing.clone(), true);
            }
            let count = unsafe { get_u32(pool, offset + 1) } as usize;
            let items_off = unsafe { get_u32(pool, offset + 5) } as usize;
            let rc = Rc::new(RefCell::new(Vec::with_capacity(count)));
            id_map.insert(offset, Value::Map(rc.clone()));
            let mut ok = true;
            for i in 0..count {
                let key_off = unsafe { get_u32(pool, items_off + i * 8) } as usize;
                let val_off = unsafe { get_u32(pool, items_off + i * 8 + 4) } as usize;
                let (k, ok1) = copy_out_node(key_off, pool, id_map, serializer);
                let (v, ok2) = copy_out_node(val_off, pool, id_map, serializer);
                ok &= ok1 && ok2;
                rc.borrow_mut().push((k, v));
            }
            (Value::Map(rc), ok)
        }
        TAG_REFCELL => {
            if let Some(existing) = id_map.get(&offset) {
                return (existing.clone(), true);
            }
            let target_off = unsafe { get_u32(pool, offset + 1) } as usize;
            let rc = Rc::new(RefCell::new(Value::Null));
            id_map.insert(offset, Value::Ref(rc.clone()));
            let (inner, ok) = copy_out_node(target_off, pool, id_map, serializer);
            *rc.borrow_mut() = inner;
            (Value::Ref(rc), ok)
        }
        TAG_ALIAS => {
            let target = unsafe { get_u32(pool, offset + 1) } as usize;
            match id_map.get(&target) {
                Some(existing) => (existing.clone(), true),
                None => copy_out_node(target, pool, id_map, serializer),
            }
        }
        TAG_OPAQUE => {
            let kind = if unsafe { get_u8(pool, offset + 1) } == OpaqueKind::Object as u8 {
                OpaqueKind::Object
            } else {
                OpaqueKind::Array
            };
            let len = unsafe { get_u32(pool, offset + 2) } as usize;
            let bytes = unsafe { pool.read(offset + 6, len) }.to_vec();
            match serializer {
                Some(s) => match s.decode(&bytes) {
                    Some(v) => (v, true),
                    None => (Value::Null, false),
                },
                None => (Value::Opaque { kind, bytes }, true),
            }
        }
        _ => (Value::Null, false),
    }
}

/// Read an in-place `Int` node at pool-relative `offset`, or `None` if the
/// node there isn't an `Int` (composite/opaque payloads cannot be read this
/// way — see spec §4.5's update restriction).
///
/// # Safety
/// `offset` must have been returned by a prior `copy_in` into `pool`.
pub unsafe fn read_int(pool: &Pool, offset: usize) -> Option<i64> {
    if get_u8(pool, offset) == TAG_INT {
        Some(get_i64(pool, offset + 1))
    } else {
        None
    }
}

/// Overwrite an in-place `Int` node at pool-relative `offset` without
/// reallocating. Returns `false` (and writes nothing) if the node isn't an
/// `Int` — this is the mechanism `Cache::update`'s updater callback uses to
/// mutate numeric counters atomically-in-place (spec §4.5 rationale).
///
/// # Safety
/// Same as [`read_int`].
pub unsafe fn write_int(pool: &Pool, offset: usize, v: i64) -> bool {
    if get_u8(pool, offset) == TAG_INT {
        put_i64(pool, offset + 1, v);
        true
    } else {
        false
    }
}

/// Whether the node at pool-relative `offset` was written as an opaque
/// serializer-encoded payload (spec §4.5: `update` refuses these outright
/// since their bytes are frozen by the serializer rather than laid out as
/// individually addressable fields).
///
/// # Safety
/// Same as [`read_int`].
pub unsafe fn is_opaque(pool: &Pool, offset: usize) -> bool {
    get_u8(pool, offset) == TAG_OPAQUE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(capacity: usize) -> (Vec<u8>, Pool) {
        let mut buf = vec![0u8; capacity];
        let ptr = buf.as_mut_ptr();
        let pool = unsafe { Pool::new(ptr, 0, capacity) };
        (buf, pool)
    }

    #[test]
    fn scalars_round_trip() {
        for v in [Value::Null, Value::Bool(true), Value::Int(-42), Value::Float(1.5), Value::Str(b"hi".to_vec())] {
            let size = encoded_size(&v, None).unwrap();
            let (_buf, pool) = pool_of(size);
            let off = copy_in(&v, &pool, None).unwrap();
            let (out, ok) = copy_out(off, &pool, None);
            assert!(ok);
            assert_eq!(format!("{v:?}"), format!("{out:?}"));
        }
    }

    #[test]
    fn shared_subobject_is_shared_after_round_trip() {
        let inner = Value::seq(vec![Value::Int(1)]);
        let outer = Value::seq(vec![inner.clone(), inner]);
        let size = encoded_size(&outer, None).unwrap();
        let (_buf, pool) = pool_of(size);
        let off = copy_in(&outer, &pool, None).unwrap();
        let (out, ok) = copy_out(off, &pool, None);
        assert!(ok);
        if let Value::Seq(rc) = out {
            let items = rc.borrow();
            match (&items[0], &items[1]) {
                (Value::Seq(a), Value::Seq(b)) => assert!(Rc::ptr_eq(a, b)),
                _ => panic!("expected two Seq elements"),
            }
        } else {
            panic!("expected Seq");
        }
    }

    #[test]
    fn cyclic_graph_round_trips_without_recursing_forever() {
        let rc = Rc::new(RefCell::new(Vec::new()));
        rc.borrow_mut().push(Value::Seq(rc.clone()));
        let cyclic = Value::Seq(rc);
        let size = encoded_size(&cyclic, None).unwrap();
        let (_buf, pool) = pool_of(size);
        let off = copy_in(&cyclic, &pool, None).unwrap();
        let (out, ok) = copy_out(off, &pool, None);
        assert!(ok);
        if let Value::Seq(outer_rc) = &out {
            let items = outer_rc.borrow();
            if let Value::Seq(inner_rc) = &items[0] {
                assert!(Rc::ptr_eq(outer_rc, inner_rc));
            } else {
                panic!("expected inner Seq");
            }
        } else {
            panic!("expected Seq");
        }
    }

    #[test]
    fn text_serializer_round_trips_a_cyclic_value_without_overflowing() {
        let rc = Rc::new(RefCell::new(Vec::new()));
        rc.borrow_mut().push(Value::Seq(rc.clone()));
        let cyclic = Value::Seq(rc);
        let ser = TextSerializer;
        let bytes = ser.encode(&cyclic).expect("encode must terminate on a cycle");
        let decoded = ser.decode(&bytes).expect("decode must reconstruct the cycle");
        if let Value::Seq(outer_rc) = &decoded {
            let items = outer_rc.borrow();
            if let Value::Seq(inner_rc) = &items[0] {
                assert!(Rc::ptr_eq(outer_rc, inner_rc));
            } else {
                panic!("expected inner Seq");
            }
        } else {
            panic!("expected Seq");
        }
    }

    #[test]
    fn cyclic_value_with_serializer_configured_does_not_overflow() {
        // Same shape as spec §8 scenario 4, but with a serializer configured
        // so the cyclic Seq is routed through `TextSerializer::encode`
        // instead of the structural copier (value.rs review: this path used
        // to recurse forever inside `write_text`).
        let rc = Rc::new(RefCell::new(Vec::new()));
        rc.borrow_mut().push(Value::Seq(rc.clone()));
        let cyclic = Value::Seq(rc);
        let ser = TextSerializer;
        let size = encoded_size(&cyclic, Some(&ser)).unwrap();
        let (_buf, pool) = pool_of(size);
        let off = copy_in(&cyclic, &pool, Some(&ser)).unwrap();
        let (out, ok) = copy_out(off, &pool, Some(&ser));
        assert!(ok);
        match out {
            Value::Seq(rc) => assert_eq!(rc.borrow().len(), 1),
            other => panic!("expected Seq after decode, got {other:?}"),
        }
    }

    #[test]
    fn serializer_backed_array_becomes_opaque_and_decodes() {
        let arr = Value::seq(vec![Value::Int(1), Value::Str(b"x".to_vec())]);
        let ser = TextSerializer;
        let size = encoded_size(&arr, Some(&ser)).unwrap();
        let (_buf, pool) = pool_of(size);
        let off = copy_in(&arr, &pool, Some(&ser)).unwrap();
        let (out, ok) = copy_out(off, &pool, Some(&ser));
        assert!(ok);
        match out {
            Value::Seq(rc) => assert_eq!(rc.borrow().len(), 2),
            other => panic!("expected Seq after decode, got {other:?}"),
        }
    }

    #[test]
    fn decode_failure_yields_null_and_false() {
        struct AlwaysFailsDecode;
        impl Serializer for AlwaysFailsDecode {
            fn encode(&self, _v: &Value) -> Option<Vec<u8>> {
                Some(vec![1, 2, 3])
            }
            fn decode(&self, _b: &[u8]) -> Option<Value> {
                None
            }
        }
        let arr = Value::seq(vec![Value::Int(1)]);
        let ser = AlwaysFailsDecode;
        let size = encoded_size(&arr, Some(&ser)).unwrap();
        let (_buf, pool) = pool_of(size);
        let off = copy_in(&arr, &pool, Some(&ser)).unwrap();
        let (out, ok) = copy_out(off, &pool, Some(&ser));
        assert!(!ok);
        assert!(matches!(out, Value::Null));
    }
}
