//! Callstack interning.
//!
//! [`CallstackTrie`] assigns ids to every function name, mapping, frame and callsite seen by any
//! data source. Ids only ever grow, so clearing the trie never makes an old id mean something
//! new. Each data source owns an [`InterningOutputTracker`] that remembers which ids it already
//! wrote in the current incremental state generation of its sequence.

use std::collections::{HashMap, HashSet};

use perfetto_protos::interned_data::InternedData;
use perfetto_protos::profile_common::{Callstack, Frame, InternedString, Mapping};

use crate::sample::FrameData;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MappingKey {
    build_id: String,
    path: String,
    start: u64,
    end: u64,
    offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FrameKey {
    function_name_id: u64,
    mapping_id: u64,
    rel_pc: u64,
}

#[derive(Debug, Clone, Copy)]
struct InternedMapping {
    build_id: u64,
    path: u64,
    start: u64,
    end: u64,
    offset: u64,
}

#[derive(Debug, Clone, Copy)]
struct Callsite {
    parent: Option<u64>,
    frame_id: u64,
}

pub struct CallstackTrie {
    next_id: u64,
    strings: HashMap<String, u64>,
    string_values: HashMap<u64, String>,
    mappings: HashMap<MappingKey, u64>,
    mapping_values: HashMap<u64, InternedMapping>,
    frames: HashMap<FrameKey, u64>,
    frame_values: HashMap<u64, FrameKey>,
    root: u64,
    children: HashMap<(u64, u64), u64>,
    callsites: HashMap<u64, Callsite>,
}

impl Default for CallstackTrie {
    fn default() -> Self {
        Self::new()
    }
}

/// Id of the empty string, written once per generation by the fixed internings packet.
pub const EMPTY_STRING_IID: u64 = 0;

impl CallstackTrie {
    pub fn new() -> Self {
        let mut trie = CallstackTrie {
            next_id: 1,
            strings: HashMap::new(),
            string_values: HashMap::new(),
            mappings: HashMap::new(),
            mapping_values: HashMap::new(),
            frames: HashMap::new(),
            frame_values: HashMap::new(),
            root: 0,
            children: HashMap::new(),
            callsites: HashMap::new(),
        };
        trie.root = trie.alloc_id();
        trie
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn intern_string(&mut self, s: &str) -> u64 {
        if s.is_empty() {
            return EMPTY_STRING_IID;
        }
        if let Some(id) = self.strings.get(s) {
            return *id;
        }
        let id = self.alloc_id();
        self.strings.insert(s.to_string(), id);
        self.string_values.insert(id, s.to_string());
        id
    }

    fn intern_mapping(&mut self, frame: &FrameData) -> u64 {
        let key = MappingKey {
            build_id: frame.build_id.clone(),
            path: frame.map_name.clone(),
            start: frame.map_start,
            end: frame.map_end,
            offset: frame.map_offset,
        };
        if let Some(id) = self.mappings.get(&key) {
            return *id;
        }
        let mapping = InternedMapping {
            build_id: self.intern_string(&frame.build_id),
            path: self.intern_string(&frame.map_name),
            start: frame.map_start,
            end: frame.map_end,
            offset: frame.map_offset,
        };
        let id = self.alloc_id();
        self.mappings.insert(key, id);
        self.mapping_values.insert(id, mapping);
        id
    }

    fn intern_frame(&mut self, frame: &FrameData) -> u64 {
        let key = FrameKey {
            function_name_id: self.intern_string(&frame.function_name),
            mapping_id: self.intern_mapping(frame),
            rel_pc: frame.rel_pc,
        };
        if let Some(id) = self.frames.get(&key) {
            return *id;
        }
        let id = self.alloc_id();
        self.frames.insert(key, id);
        self.frame_values.insert(id, key);
        id
    }

    /// Interns a callstack given outermost frame first, returning the id of its leaf callsite.
    pub fn create_callstack(&mut self, frames: &[FrameData]) -> u64 {
        let mut node = self.root;
        for frame in frames {
            let frame_id = self.intern_frame(frame);
            node = match self.children.get(&(node, frame_id)) {
                Some(child) => *child,
                None => {
                    let child = self.alloc_id();
                    self.children.insert((node, frame_id), child);
                    self.callsites.insert(
                        child,
                        Callsite {
                            parent: Some(node),
                            frame_id,
                        },
                    );
                    child
                }
            };
        }
        node
    }

    /// Frame ids of a callstack, outermost first.
    fn frame_ids(&self, callstack_iid: u64) -> Vec<u64> {
        let mut ids = Vec::new();
        let mut node = callstack_iid;
        while let Some(callsite) = self.callsites.get(&node) {
            ids.push(callsite.frame_id);
            match callsite.parent {
                Some(parent) => node = parent,
                None => break,
            }
        }
        ids.reverse();
        ids
    }

    /// Drops every interned entry. Ids handed out before stay unique.
    pub fn clear_trie(&mut self) {
        self.strings.clear();
        self.string_values.clear();
        self.mappings.clear();
        self.mapping_values.clear();
        self.frames.clear();
        self.frame_values.clear();
        self.children.clear();
        self.callsites.clear();
        self.root = self.alloc_id();
    }

    pub fn is_empty(&self) -> bool {
        self.callsites.is_empty() && self.frames.is_empty()
    }
}

fn interned_string(iid: u64, s: &str) -> InternedString {
    let mut interned = InternedString::default();
    interned.set_iid(iid);
    interned.set_str(s.as_bytes().to_vec());
    interned
}

#[derive(Default)]
pub struct InterningOutputTracker {
    put_function_names: HashSet<u64>,
    put_paths: HashSet<u64>,
    put_build_ids: HashSet<u64>,
    put_mappings: HashSet<u64>,
    put_frames: HashSet<u64>,
    put_callstacks: HashSet<u64>,
}

impl InterningOutputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries that every sequence relies on without ever writing them explicitly.
    pub fn write_fixed_interning(interned: &mut InternedData) {
        interned
            .build_ids
            .push(interned_string(EMPTY_STRING_IID, ""));
        interned
            .mapping_paths
            .push(interned_string(EMPTY_STRING_IID, ""));
        interned
            .function_names
            .push(interned_string(EMPTY_STRING_IID, ""));
    }

    /// Adds everything `callstack_iid` references that this sequence hasn't seen yet.
    pub fn write_callstack(
        &mut self,
        callstack_iid: u64,
        trie: &CallstackTrie,
        interned: &mut InternedData,
    ) {
        if self.put_callstacks.contains(&callstack_iid) {
            return;
        }
        let frame_ids = trie.frame_ids(callstack_iid);
        for frame_id in &frame_ids {
            if !self.put_frames.insert(*frame_id) {
                continue;
            }
            let Some(key) = trie.frame_values.get(frame_id) else {
                continue;
            };
            self.write_function_name(key.function_name_id, trie, interned);
            self.write_mapping(key.mapping_id, trie, interned);

            let mut frame = Frame::default();
            frame.set_iid(*frame_id);
            frame.set_function_name_id(key.function_name_id);
            frame.set_mapping_id(key.mapping_id);
            frame.set_rel_pc(key.rel_pc);
            interned.frames.push(frame);
        }

        let mut callstack = Callstack::default();
        callstack.set_iid(callstack_iid);
        callstack.frame_ids = frame_ids;
        interned.callstacks.push(callstack);
        self.put_callstacks.insert(callstack_iid);
    }

    fn write_function_name(&mut self, iid: u64, trie: &CallstackTrie, interned: &mut InternedData) {
        if iid == EMPTY_STRING_IID || !self.put_function_names.insert(iid) {
            return;
        }
        if let Some(name) = trie.string_values.get(&iid) {
            interned.function_names.push(interned_string(iid, name));
        }
    }

    fn write_mapping(&mut self, iid: u64, trie: &CallstackTrie, interned: &mut InternedData) {
        if !self.put_mappings.insert(iid) {
            return;
        }
        let Some(mapping) = trie.mapping_values.get(&iid) else {
            return;
        };
        if mapping.build_id != EMPTY_STRING_IID && self.put_build_ids.insert(mapping.build_id) {
            if let Some(build_id) = trie.string_values.get(&mapping.build_id) {
                interned
                    .build_ids
                    .push(interned_string(mapping.build_id, build_id));
            }
        }
        if mapping.path != EMPTY_STRING_IID && self.put_paths.insert(mapping.path) {
            if let Some(path) = trie.string_values.get(&mapping.path) {
                interned
                    .mapping_paths
                    .push(interned_string(mapping.path, path));
            }
        }

        let mut proto = Mapping::default();
        proto.set_iid(iid);
        proto.set_build_id(mapping.build_id);
        proto.set_start(mapping.start);
        proto.set_end(mapping.end);
        proto.set_start_offset(mapping.offset);
        proto.path_string_ids.push(mapping.path);
        interned.mappings.push(proto);
    }

    /// Forgets everything written, for a new incremental state generation.
    pub fn clear_history(&mut self) {
        self.put_function_names.clear();
        self.put_paths.clear();
        self.put_build_ids.clear();
        self.put_mappings.clear();
        self.put_frames.clear();
        self.put_callstacks.clear();
    }
}
