//! Heap, allocator and tri-color mark-sweep garbage collector
//!
//! Objects live in a slot arena addressed by `ObjRef` handles. Every slot
//! carries a mark bit and an allocation-list link; the list threads all live
//! objects so the sweep can splice out dead ones and return their slots to a
//! free list. The heap also owns the string intern table, which is weak: any
//! interned string that the mark phase did not reach is dropped from the
//! table before the sweep frees it.
//!
//! Collection runs at safe points: the owner (VM or compiler) asks
//! `should_collect` once per instruction/declaration and calls `collect`
//! with its current roots. Stress mode collects at every safe point.

use opal_config::GcConfig;

use crate::chunk::Chunk;
use crate::object::{
    ArrayObj, ErrorObj, FunctionObj, Obj, StrObj, TableObj, UpvalueLocation, UpvalueObj,
};
use crate::table::Table;
use crate::value::{format_number, Value};

/// Handle to a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(u32);

impl ObjRef {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// FNV-1a over a byte slice (32-bit)
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// One arena slot: header plus payload
struct Slot {
    marked: bool,
    next: Option<ObjRef>,
    obj: Obj,
}

/// Root set handed to `collect`
///
/// The VM fills the stack/frame/global/upvalue fields; the compiler fills
/// the chunk and name fields for every function still under construction.
#[derive(Default)]
pub struct Roots<'a> {
    /// Every live value-stack slot
    pub stack: &'a [Value],
    /// The closure of every call frame
    pub frame_closures: &'a [ObjRef],
    /// The globals table (keys and values)
    pub globals: Option<&'a Table>,
    /// Head of the open-upvalue list
    pub open_upvalues: Option<ObjRef>,
    /// The interned `init` string
    pub init_string: Option<ObjRef>,
    /// Chunks of the compiler's live function chain
    pub compiler_chunks: Vec<&'a Chunk>,
    /// Interned handles held directly by the compiler chain (function names)
    pub compiler_names: Vec<ObjRef>,
}

/// The object heap
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Head of the allocation list threading every live object
    objects: Option<ObjRef>,
    /// Approximate live bytes
    bytes_allocated: usize,
    /// Threshold for the next collection
    next_gc: usize,
    /// Gray worklist for the trace phase
    gray: Vec<ObjRef>,
    /// Weak intern table: content-unique strings
    strings: Table,
    config: GcConfig,
}

impl Heap {
    /// Create an empty heap
    pub fn new(config: GcConfig) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            objects: None,
            bytes_allocated: 0,
            next_gc: config.initial_threshold,
            gray: Vec::new(),
            strings: Table::new(),
            config,
        }
    }

    /// Allocate an object, registering it on the allocation list
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += obj.size_estimate();
        let slot = Slot {
            marked: false,
            next: self.objects,
            obj,
        };
        let handle = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef::new(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef::new(self.slots.len() as u32 - 1)
            }
        };
        self.objects = Some(handle);
        handle
    }

    /// Record growth of an existing object (array push, table insert)
    pub fn note_growth(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    /// Intern a string: byte-equal strings share one object
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = fnv1a(chars.as_bytes());
        let slots = &self.slots;
        let existing = self.strings.find_string(hash, |candidate| {
            match &slots[candidate.index()] {
                Some(slot) => matches!(&slot.obj, Obj::Str(s) if &*s.chars == chars),
                None => false,
            }
        });
        if let Some(found) = existing {
            return found;
        }
        let handle = self.alloc(Obj::Str(StrObj {
            chars: chars.into(),
            hash,
        }));
        self.strings.set(handle, hash, Value::Nil);
        handle
    }

    /// Borrow an object
    pub fn get(&self, handle: ObjRef) -> &Obj {
        &self
            .slots[handle.index()]
            .as_ref()
            .expect("use of freed object")
            .obj
    }

    /// Mutably borrow an object
    pub fn get_mut(&mut self, handle: ObjRef) -> &mut Obj {
        &mut self
            .slots[handle.index()]
            .as_mut()
            .expect("use of freed object")
            .obj
    }

    /// The string contents, when the handle is a string
    pub fn as_str(&self, handle: ObjRef) -> Option<&str> {
        match self.get(handle) {
            Obj::Str(s) => Some(&s.chars),
            _ => None,
        }
    }

    /// The string hash, when the handle is a string
    pub fn str_hash(&self, handle: ObjRef) -> Option<u32> {
        match self.get(handle) {
            Obj::Str(s) => Some(s.hash),
            _ => None,
        }
    }

    /// The function payload, when the handle is a function
    pub fn as_function(&self, handle: ObjRef) -> Option<&FunctionObj> {
        match self.get(handle) {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Number of live objects (test and diagnostics aid)
    pub fn live_objects(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.objects;
        while let Some(handle) = cursor {
            count += 1;
            cursor = self.slots[handle.index()].as_ref().and_then(|s| s.next);
        }
        count
    }

    /// Approximate live bytes
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// True when an interned string for `chars` exists (test aid)
    pub fn is_interned(&self, chars: &str) -> bool {
        let hash = fnv1a(chars.as_bytes());
        let slots = &self.slots;
        self.strings
            .find_string(hash, |candidate| match &slots[candidate.index()] {
                Some(slot) => matches!(&slot.obj, Obj::Str(s) if &*s.chars == chars),
                None => false,
            })
            .is_some()
    }

    /// Whether the allocation threshold (or stress mode) asks for a collection
    pub fn should_collect(&self) -> bool {
        self.config.stress || self.bytes_allocated > self.next_gc
    }

    /// Run a full mark-sweep collection over the given roots
    pub fn collect(&mut self, roots: &Roots) {
        let before = self.bytes_allocated;
        if self.config.log {
            eprintln!("-- gc begin ({} bytes live)", before);
        }

        self.mark_roots(roots);
        self.trace_references();
        self.remove_unmarked_strings();
        self.sweep();

        self.next_gc = self.bytes_allocated * self.config.grow_factor;
        if self.config.log {
            eprintln!(
                "-- gc end (freed {} bytes, next at {})",
                before.saturating_sub(self.bytes_allocated),
                self.next_gc
            );
        }
    }

    fn mark_roots(&mut self, roots: &Roots) {
        for value in roots.stack {
            self.mark_value(*value);
        }
        for closure in roots.frame_closures {
            self.mark_object(*closure);
        }
        if let Some(globals) = roots.globals {
            for (key, value) in globals.iter() {
                self.mark_object(key);
                self.mark_value(value);
            }
        }
        let mut open = roots.open_upvalues;
        while let Some(upvalue) = open {
            self.mark_object(upvalue);
            open = match self.get(upvalue) {
                Obj::Upvalue(u) => u.next_open,
                _ => None,
            };
        }
        if let Some(init) = roots.init_string {
            self.mark_object(init);
        }
        for chunk in &roots.compiler_chunks {
            for constant in &chunk.constants {
                self.mark_value(*constant);
            }
        }
        for name in &roots.compiler_names {
            self.mark_object(*name);
        }
    }

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    fn mark_object(&mut self, handle: ObjRef) {
        let slot = self.slots[handle.index()]
            .as_mut()
            .expect("marked a freed object");
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(handle);
    }

    fn trace_references(&mut self) {
        while let Some(handle) = self.gray.pop() {
            self.blacken(handle);
        }
    }

    /// Mark everything the object owns
    fn blacken(&mut self, handle: ObjRef) {
        // Gather children first so marking does not fight the borrow
        let mut child_objects: Vec<ObjRef> = Vec::new();
        let mut child_values: Vec<Value> = Vec::new();
        match self.get(handle) {
            Obj::Str(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    child_objects.push(name);
                }
                child_values.extend_from_slice(&f.chunk.constants);
            }
            Obj::Closure(c) => {
                child_objects.push(c.function);
                child_objects.extend_from_slice(&c.upvalues);
            }
            Obj::Upvalue(u) => {
                if let UpvalueLocation::Closed(value) = u.location {
                    child_values.push(value);
                }
            }
            Obj::Class(c) => {
                child_objects.push(c.name);
                for (key, value) in c.methods.iter() {
                    child_objects.push(key);
                    child_values.push(value);
                }
            }
            Obj::Instance(i) => {
                child_objects.push(i.class);
                for (key, value) in i.fields.iter() {
                    child_objects.push(key);
                    child_values.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                child_values.push(b.receiver);
                child_objects.push(b.method);
            }
            Obj::Table(t) => {
                for (key, value) in t.entries.iter() {
                    child_objects.push(key);
                    child_values.push(value);
                }
            }
            Obj::Array(a) => {
                child_values.extend_from_slice(&a.items);
            }
            Obj::Error(e) => {
                child_objects.push(e.message);
                if let Some(cause) = e.cause {
                    child_objects.push(cause);
                }
            }
        }
        for child in child_objects {
            self.mark_object(child);
        }
        for child in child_values {
            self.mark_value(child);
        }
    }

    /// Drop intern entries whose key did not survive marking
    ///
    /// Must run before the sweep so no freed string is ever read.
    fn remove_unmarked_strings(&mut self) {
        let slots = &self.slots;
        self.strings.retain_keys(|key| {
            slots[key.index()].as_ref().map_or(false, |slot| slot.marked)
        });
    }

    fn sweep(&mut self) {
        let mut previous: Option<ObjRef> = None;
        let mut cursor = self.objects;
        while let Some(handle) = cursor {
            let (marked, next) = {
                let slot = self.slots[handle.index()]
                    .as_ref()
                    .expect("sweep hit a freed slot");
                (slot.marked, slot.next)
            };
            if marked {
                self.slots[handle.index()]
                    .as_mut()
                    .expect("sweep hit a freed slot")
                    .marked = false;
                previous = Some(handle);
            } else {
                match previous {
                    Some(prev) => {
                        self.slots[prev.index()]
                            .as_mut()
                            .expect("sweep lost the previous slot")
                            .next = next;
                    }
                    None => self.objects = next,
                }
                let freed = self.slots[handle.index()]
                    .as_ref()
                    .map_or(0, |slot| slot.obj.size_estimate());
                self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
                self.slots[handle.index()] = None;
                self.free.push(handle.index() as u32);
            }
            cursor = next;
        }
    }

    /// Render a value for `print`
    pub fn display(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(handle) => self.display_obj(handle),
        }
    }

    fn display_obj(&self, handle: ObjRef) -> String {
        match self.get(handle) {
            Obj::Str(s) => s.chars.to_string(),
            Obj::Function(f) => match f.name.and_then(|n| self.as_str(n)) {
                Some(name) => format!("<fn {}>", name),
                None => "<script>".to_string(),
            },
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Closure(c) => self.display_obj(c.function),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => format!(
                "<class {}>",
                self.as_str(c.name).unwrap_or("?")
            ),
            Obj::Instance(i) => {
                let name = match self.get(i.class) {
                    Obj::Class(c) => self.as_str(c.name).unwrap_or("?"),
                    _ => "?",
                };
                format!("<{} instance>", name)
            }
            Obj::BoundMethod(b) => self.display_obj(b.method),
            Obj::Table(t) => format!("<table of {}>", t.entries.len()),
            Obj::Array(a) => {
                let items: Vec<String> =
                    a.items.iter().map(|item| self.display(*item)).collect();
                format!("[{}]", items.join(", "))
            }
            Obj::Error(e) => format!(
                "<error: {}>",
                self.as_str(e.message).unwrap_or("?")
            ),
        }
    }

    /// Render a value for `+` concatenation: strings keep their contents,
    /// immediates stringify, every other object becomes `<object>`.
    pub fn stringify(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(handle) => match self.get(handle) {
                Obj::Str(s) => s.chars.to_string(),
                _ => "<object>".to_string(),
            },
        }
    }

    /// Convenience allocators used across the runtime
    pub fn new_array(&mut self, items: Vec<Value>) -> ObjRef {
        self.alloc(Obj::Array(ArrayObj { items }))
    }

    /// Allocate an empty table value
    pub fn new_table(&mut self) -> ObjRef {
        self.alloc(Obj::Table(TableObj::default()))
    }

    /// Allocate an error value with an interned message
    pub fn new_error(&mut self, message: &str, cause: Option<ObjRef>) -> ObjRef {
        let message = self.intern(message);
        self.alloc(Obj::Error(ErrorObj { message, cause }))
    }

    /// Allocate an open upvalue pointing at a stack slot
    pub fn new_upvalue(&mut self, slot: usize, next_open: Option<ObjRef>) -> ObjRef {
        self.alloc(Obj::Upvalue(UpvalueObj {
            location: UpvalueLocation::Stack(slot),
            next_open,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ClosureObj;
    use pretty_assertions::assert_eq;

    fn test_heap() -> Heap {
        Heap::new(GcConfig::default())
    }

    #[test]
    fn test_intern_is_idempotent() {
        let mut heap = test_heap();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.as_str(a), Some("hello"));
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = test_heap();
        let keep = heap.intern("keep");
        heap.intern("drop1");
        heap.intern("drop2");
        assert_eq!(heap.live_objects(), 3);

        let stack = [Value::Obj(keep)];
        let roots = Roots {
            stack: &stack,
            ..Roots::default()
        };
        heap.collect(&roots);

        assert_eq!(heap.live_objects(), 1);
        assert!(heap.is_interned("keep"));
        assert!(!heap.is_interned("drop1"));
    }

    #[test]
    fn test_collect_traces_closure_to_function() {
        let mut heap = test_heap();
        let name = heap.intern("f");
        let function = heap.alloc(Obj::Function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: Some(name),
        }));
        let closure = heap.alloc(Obj::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        heap.intern("unreachable");

        let stack = [Value::Obj(closure)];
        let roots = Roots {
            stack: &stack,
            ..Roots::default()
        };
        heap.collect(&roots);

        // Closure, its function, and the function's name survive
        assert_eq!(heap.live_objects(), 3);
        assert_eq!(heap.as_str(name), Some("f"));
    }

    #[test]
    fn test_open_upvalue_roots_survive() {
        let mut heap = test_heap();
        let upvalue = heap.new_upvalue(0, None);
        let roots = Roots {
            open_upvalues: Some(upvalue),
            ..Roots::default()
        };
        heap.collect(&roots);
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn test_closed_upvalue_keeps_its_value() {
        let mut heap = test_heap();
        let captured = heap.intern("captured");
        let upvalue = heap.alloc(Obj::Upvalue(UpvalueObj {
            location: UpvalueLocation::Closed(Value::Obj(captured)),
            next_open: None,
        }));
        let stack = [Value::Obj(upvalue)];
        let roots = Roots {
            stack: &stack,
            ..Roots::default()
        };
        heap.collect(&roots);
        assert_eq!(heap.live_objects(), 2);
        assert!(heap.is_interned("captured"));
    }

    #[test]
    fn test_slots_are_reused_after_sweep() {
        let mut heap = test_heap();
        heap.intern("transient");
        heap.collect(&Roots::default());
        assert_eq!(heap.live_objects(), 0);
        let revived = heap.intern("transient");
        // The freed slot is recycled rather than growing the arena
        assert_eq!(revived.index(), 0);
    }

    #[test]
    fn test_stress_mode_requests_collection() {
        let config = GcConfig {
            stress: true,
            ..GcConfig::default()
        };
        let heap = Heap::new(config);
        assert!(heap.should_collect());
    }

    #[test]
    fn test_fnv1a_known_vectors() {
        // Reference values for the 32-bit FNV-1a function
        assert_eq!(fnv1a(b""), 2166136261);
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9cf968);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashMap;

        proptest! {
            /// Interning is idempotent and content-keyed: equal text always
            /// yields the same handle, and the handle reads back verbatim.
            #[test]
            fn prop_intern_is_content_keyed(
                words in proptest::collection::vec("[a-z]{0,8}", 0..64)
            ) {
                let mut heap = test_heap();
                let mut seen: HashMap<String, ObjRef> = HashMap::new();
                for word in &words {
                    let handle = heap.intern(word);
                    let expected = *seen.entry(word.clone()).or_insert(handle);
                    prop_assert_eq!(expected, handle);
                    prop_assert_eq!(heap.as_str(handle), Some(word.as_str()));
                }
            }
        }
    }
}
