//! The prefix-packed byte stream itself (`spec.md` §4.3).
//!
//! Opcodes are `Null`, `Link(n)` (a back-reference `n` nodes before the
//! current position in visitation order) and `Vinfo { nfields, source }`
//! followed by its `nfields` children. The original interleaves writing
//! left-to-right with a reader that walks right-to-left so arrays
//! reconstruct highest-index-first without an intermediate buffer; that
//! cleverness is a hot-path artifact (Design Note "Source-language flavor
//! as tagged variants" applies here too), so this codec instead assigns
//! each node a time index on first visit and resolves both write-time and
//! read-time sharing against that same counter with an ordinary recursive
//! descent.

use crate::entities::VinfoRef;
use crate::settings::Settings;
use crate::source::{CompileTimeSource, Known, RunTimeSource, Source, VirtualTimeSource};
use crate::vinfo::VinfoGraph;
use rustc_hash::FxHashMap;
use std::sync::Arc;

const TAG_NULL: u8 = 0;
const TAG_LINK: u8 = 1;
const TAG_RUNTIME: u8 = 2;
const TAG_COMPILETIME: u8 = 3;
const TAG_VIRTUALTIME: u8 = 4;

fn write_varint(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> u32 {
    let mut value = 0u32;
    let mut shift = 0;
    loop {
        let byte = buf[*pos];
        *pos += 1;
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    value
}

/// Looks up the `VirtualSpec` a decoded virtual-time node's name refers
/// to. A decoder has no way to invent a `VirtualSpec` impl from a bare
/// name, so the caller supplies the table of specs it knows about (in
/// practice, `Compiler`'s registered set from `crate::virtualtime`).
pub trait SpecRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<dyn crate::source::VirtualSpec>>;
}

struct Writer<'a> {
    buf: Vec<u8>,
    times: FxHashMap<VinfoRef, u32>,
    next_time: u32,
    settings: &'a Settings,
}

impl<'a> Writer<'a> {
    fn write_slot(&mut self, graph: &VinfoGraph, slot: Option<VinfoRef>) {
        let Some(v) = slot else {
            self.buf.push(TAG_NULL);
            return;
        };
        if let Some(&t) = self.times.get(&v) {
            self.buf.push(TAG_LINK);
            write_varint(&mut self.buf, self.next_time - t);
            return;
        }
        let time = self.next_time;
        self.next_time += 1;
        self.times.insert(v, time);

        let node = graph.get(v);
        let skip_fields = self.settings.compress_compiletime_subitems && node.source.is_compiletime();
        match &node.source {
            Source::RunTime(rt) => {
                self.buf.push(TAG_RUNTIME);
                write_varint(&mut self.buf, node.field_count() as u32);
                self.write_runtime_source(rt);
            }
            Source::CompileTime(ct) => {
                self.buf.push(TAG_COMPILETIME);
                write_varint(&mut self.buf, if skip_fields { 0 } else { node.field_count() as u32 });
                self.write_compiletime_source(ct);
            }
            Source::VirtualTime(vt) => {
                self.buf.push(TAG_VIRTUALTIME);
                write_varint(&mut self.buf, node.field_count() as u32);
                self.write_virtualtime_source(vt);
            }
        }
        if skip_fields {
            return;
        }
        let field_count = node.field_count();
        for i in 0..field_count {
            let child = graph.get(v).field(i);
            self.write_slot(graph, child);
        }
    }

    fn write_runtime_source(&mut self, rt: &RunTimeSource) {
        let mut flags = 0u8;
        if rt.has_ref {
            flags |= 1;
        }
        if rt.non_neg {
            flags |= 2;
        }
        if rt.megamorphic {
            flags |= 4;
        }
        if rt.stack_offset.is_some() {
            flags |= 8;
        }
        if rt.register.is_some() {
            flags |= 16;
        }
        self.buf.push(flags);
        if let Some(off) = rt.stack_offset {
            write_varint(&mut self.buf, off);
        }
        if let Some(reg) = rt.register {
            write_varint(&mut self.buf, reg.0 as u32);
        }
    }

    fn write_compiletime_source(&mut self, ct: &CompileTimeSource) {
        let k = &ct.known;
        let mut flags = 0u8;
        if k.is_host_object {
            flags |= 1;
        }
        if k.fixed {
            flags |= 2;
        }
        self.buf.push(flags);
        self.buf.extend_from_slice(&k.value.to_le_bytes());
    }

    fn write_virtualtime_source(&mut self, vt: &VirtualTimeSource) {
        let name = vt.spec.name();
        write_varint(&mut self.buf, name.len() as u32);
        self.buf.extend_from_slice(name.as_bytes());
    }
}

/// Serialize every node reachable from `roots` into the prefix-packed
/// stream, returning the bytes a `Snapshot` stores.
pub fn encode(graph: &VinfoGraph, roots: &[VinfoRef], settings: &Settings) -> Vec<u8> {
    let mut w = Writer {
        buf: Vec::new(),
        times: FxHashMap::default(),
        next_time: 0,
        settings,
    };
    for &r in roots {
        w.write_slot(graph, Some(r));
    }
    w.buf
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    nodes: Vec<VinfoRef>,
    registry: &'a dyn SpecRegistry,
}

impl<'a> Reader<'a> {
    fn read_slot(&mut self, graph: &mut VinfoGraph) -> Option<VinfoRef> {
        let tag = self.buf[self.pos];
        self.pos += 1;
        match tag {
            TAG_NULL => None,
            TAG_LINK => {
                let n = read_varint(self.buf, &mut self.pos);
                let idx = self.nodes.len() - n as usize;
                Some(self.nodes[idx])
            }
            TAG_RUNTIME => {
                let nfields = read_varint(self.buf, &mut self.pos);
                let rt = self.read_runtime_source();
                let v = graph.new_vinfo(Source::RunTime(rt));
                self.nodes.push(v);
                self.read_children(graph, v, nfields);
                Some(v)
            }
            TAG_COMPILETIME => {
                let nfields = read_varint(self.buf, &mut self.pos);
                let ct = self.read_compiletime_source();
                let v = graph.new_vinfo(Source::CompileTime(ct));
                self.nodes.push(v);
                self.read_children(graph, v, nfields);
                Some(v)
            }
            TAG_VIRTUALTIME => {
                let nfields = read_varint(self.buf, &mut self.pos);
                let vt = self.read_virtualtime_source();
                let v = graph.new_vinfo(Source::VirtualTime(vt));
                self.nodes.push(v);
                self.read_children(graph, v, nfields);
                Some(v)
            }
            other => panic!("corrupt snapshot stream: unknown opcode tag {other}"),
        }
    }

    fn read_children(&mut self, graph: &mut VinfoGraph, parent: VinfoRef, nfields: u32) {
        use crate::vinfo::NullSink;
        let mut sink = NullSink;
        for i in 0..nfields as usize {
            let child = self.read_slot(graph);
            if let Some(c) = child {
                graph.incref(c);
            }
            graph.set_sub(parent, i, child, &mut sink).expect("decode cannot fail to enlarge a buffer");
        }
    }

    fn read_runtime_source(&mut self) -> RunTimeSource {
        let flags = self.buf[self.pos];
        self.pos += 1;
        let has_ref = flags & 1 != 0;
        let non_neg = flags & 2 != 0;
        let megamorphic = flags & 4 != 0;
        let stack_offset = if flags & 8 != 0 {
            Some(read_varint(self.buf, &mut self.pos))
        } else {
            None
        };
        let register = if flags & 16 != 0 {
            Some(crate::entities::RegId(read_varint(self.buf, &mut self.pos) as u16))
        } else {
            None
        };
        RunTimeSource {
            stack_offset,
            register,
            has_ref,
            non_neg,
            megamorphic,
        }
    }

    fn read_compiletime_source(&mut self) -> CompileTimeSource {
        let flags = self.buf[self.pos];
        self.pos += 1;
        let is_host_object = flags & 1 != 0;
        let fixed = flags & 2 != 0;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        let value = i64::from_le_bytes(bytes);
        CompileTimeSource::new(Known {
            value,
            is_host_object,
            fixed,
        })
    }

    fn read_virtualtime_source(&mut self) -> VirtualTimeSource {
        let len = read_varint(self.buf, &mut self.pos) as usize;
        let name = std::str::from_utf8(&self.buf[self.pos..self.pos + len])
            .expect("snapshot stream has valid utf-8 spec names")
            .to_owned();
        self.pos += len;
        let spec = self
            .registry
            .lookup(&name)
            .unwrap_or_else(|| panic!("no registered VirtualSpec named {name:?}"));
        VirtualTimeSource { spec }
    }
}

/// Reconstruct `root_count` roots (in the order `encode` was given them)
/// into fresh nodes of `graph`.
pub fn decode(
    bytes: &[u8],
    graph: &mut VinfoGraph,
    registry: &dyn SpecRegistry,
    root_count: usize,
) -> Vec<VinfoRef> {
    let mut r = Reader {
        buf: bytes,
        pos: 0,
        nodes: Vec::new(),
        registry,
    };
    let mut roots = Vec::with_capacity(root_count);
    for _ in 0..root_count {
        roots.push(r.read_slot(graph).expect("snapshot root slots are never absent"));
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Known;
    use crate::vinfo::NullSink;

    struct EmptyRegistry;
    impl SpecRegistry for EmptyRegistry {
        fn lookup(&self, _name: &str) -> Option<Arc<dyn crate::source::VirtualSpec>> {
            None
        }
    }

    #[test]
    fn round_trips_a_single_compiletime_leaf() {
        let mut g = VinfoGraph::new();
        let v = g.new_known_integer(42);
        let settings = Settings::default();
        let bytes = encode(&g, &[v], &settings);

        let mut g2 = VinfoGraph::new();
        let roots = decode(&bytes, &mut g2, &EmptyRegistry, 1);
        assert_eq!(roots.len(), 1);
        match &g2.get(roots[0]).source {
            Source::CompileTime(ct) => assert_eq!(ct.known.value, 42),
            _ => panic!("expected compile-time source"),
        }
    }

    #[test]
    fn round_trips_shared_subgraph_via_link() {
        let mut g = VinfoGraph::new();
        let shared = g.new_known_integer(7);
        let parent = g.new_dummy();
        let mut sink = NullSink;
        g.incref(shared);
        g.set_sub(parent, 0, Some(shared), &mut sink).unwrap();
        g.set_sub(parent, 1, Some(shared), &mut sink).unwrap();

        let settings = Settings::default();
        let bytes = encode(&g, &[parent], &settings);
        let mut g2 = VinfoGraph::new();
        let roots = decode(&bytes, &mut g2, &EmptyRegistry, 1);
        let a = g2.sub(roots[0], 0).unwrap();
        let b = g2.sub(roots[0], 1).unwrap();
        assert_eq!(a, b, "LINK must reconstruct shared sub-structure");
    }

    #[test]
    fn compress_compiletime_subitems_drops_their_children() {
        let mut g = VinfoGraph::new();
        let child = g.new_known_integer(1);
        let parent = g.new_vinfo(Source::CompileTime(crate::source::CompileTimeSource::new(Known::integer(9))));
        let mut sink = NullSink;
        g.incref(child);
        g.set_sub(parent, 0, Some(child), &mut sink).unwrap();

        let settings = Settings::builder().compress_compiletime_subitems(true).finish();
        let bytes = encode(&g, &[parent], &settings);
        let mut g2 = VinfoGraph::new();
        let roots = decode(&bytes, &mut g2, &EmptyRegistry, 1);
        assert_eq!(g2.get(roots[0]).field_count(), 0);
    }
}
