//! Streaming summariser (spec §4.D): consumes a depth-first, post-order
//! stream of file-metadata records and emits one `RecordDGUTA` per
//! directory as it closes.
use std::collections::HashMap;

use crate::age::{self, AgeBucket};
use crate::codec::Guta;
use crate::error::DgutaError;
use crate::interner::{PathId, PathInterner};

/// The kind of filesystem entry a record describes (spec §6's type
/// letters: `f d L D p S c`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Dir,
    Symlink,
    Device,
    Pipe,
    Socket,
    Char,
}

impl EntryType {
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryType::Dir)
    }
}

/// One file-metadata record as produced by the (out-of-scope) walker and
/// handed to the summariser in depth-first, post-order sequence.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub apparent_size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub inode: u64,
    pub entry_type: EntryType,
}

/// Receives `RecordDGUTA`s as directories close. The DGUTA store writer
/// (§4.E) is the production implementation; tests use an in-memory one.
pub trait DgutaSink {
    fn emit(&mut self, dir: &str, gutas: &[Guta], children: &[String]) -> Result<(), DgutaError>;
}

/// Lets a caller retain ownership of a sink across a [`Summariser::finish`]
/// call (which consumes `self`) by driving the summariser with a `&mut`
/// borrow instead, e.g. to `close()` a [`DgutaWriter`](crate::store::DgutaWriter)
/// or inspect a [`BasedirsAccumulator`](crate::basedirs::BasedirsAccumulator)
/// afterwards.
impl<T: DgutaSink> DgutaSink for &mut T {
    fn emit(&mut self, dir: &str, gutas: &[Guta], children: &[String]) -> Result<(), DgutaError> {
        (**self).emit(dir, gutas, children)
    }
}

/// Fans a single stream of `RecordDGUTA` emissions out to two sinks, e.g.
/// the DGUTA store writer and the basedirs accumulator, per the data flow
/// in spec §2 ("D ... in parallel -> G").
pub struct TeeSink<A, B> {
    pub first: A,
    pub second: B,
}

impl<A: DgutaSink, B: DgutaSink> DgutaSink for TeeSink<A, B> {
    fn emit(&mut self, dir: &str, gutas: &[Guta], children: &[String]) -> Result<(), DgutaError> {
        self.first.emit(dir, gutas, children)?;
        self.second.emit(dir, gutas, children)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Accum {
    count: u64,
    size: u64,
    atime: i64,
    mtime: i64,
}

impl Accum {
    fn merge_in(&mut self, count: u64, size: u64, atime: i64, mtime: i64) {
        self.count += count;
        self.size += size;
        if atime != 0 && (self.atime == 0 || atime < self.atime) {
            self.atime = atime;
        }
        if mtime > self.mtime {
            self.mtime = mtime;
        }
    }
}

type GutaKey = (u32, u32, u16, u8);

struct Frame {
    path_id: PathId,
    map: HashMap<GutaKey, Accum>,
    children: Vec<String>,
}

impl Frame {
    fn new(path_id: PathId) -> Self {
        Self {
            path_id,
            map: HashMap::new(),
            children: Vec::new(),
        }
    }

    fn add(&mut self, gid: u32, uid: u32, ft: u16, age: u8, count: u64, size: u64, atime: i64, mtime: i64) {
        self.map
            .entry((gid, uid, ft, age))
            .or_default()
            .merge_in(count, size, atime, mtime);
    }

    fn fold_into(self, parent: &mut Frame) {
        for ((gid, uid, ft, age), acc) in self.map {
            parent.add(gid, uid, ft, age, acc.count, acc.size, acc.atime, acc.mtime);
        }
    }

    fn into_gutas(self) -> Vec<Guta> {
        let mut out: Vec<Guta> = self
            .map
            .into_iter()
            .map(|((gid, uid, ft, age), acc)| Guta {
                gid,
                uid,
                ft,
                age,
                count: acc.count,
                size: acc.size,
                atime: acc.atime,
                mtime: acc.mtime,
            })
            .collect();
        out.sort_by_key(|g| (g.gid, g.uid, g.ft, g.age));
        out
    }
}

fn parent_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => "/",
    }
}

fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Drives the stack-of-accumulators state machine described in spec §4.D.
pub struct Summariser<S: DgutaSink> {
    interner: PathInterner,
    stack: Vec<Frame>,
    finalized: std::collections::HashSet<PathId>,
    current: PathId,
    ref_time: i64,
    sink: S,
}

impl<S: DgutaSink> Summariser<S> {
    pub fn new(ref_time: i64, sink: S) -> Self {
        let interner = PathInterner::new();
        let root = interner.root();
        Self {
            stack: vec![Frame::new(root)],
            finalized: std::collections::HashSet::new(),
            current: root,
            ref_time,
            interner,
            sink,
        }
    }

    /// Push one record. Records must arrive in depth-first, post-order
    /// sequence (spec §4.D's input contract).
    pub fn push(&mut self, record: FileRecord) -> Result<(), DgutaError> {
        let is_dir = record.entry_type.is_dir();
        let target_id = if is_dir {
            self.interner.intern(&record.path)
        } else {
            self.interner.intern(parent_dir(&record.path))
        };

        self.ascend_to_common_ancestor(target_id)?;
        self.descend_to(target_id)?;

        let name = if is_dir {
            self.interner.name(target_id).to_string()
        } else {
            basename(&record.path).to_string()
        };
        let mask = age::classify_filename(&name, is_dir);
        let atime_in = if is_dir { 0 } else { record.atime };

        let top = self.stack.last_mut().expect("stack never empty");
        for ft in age::file_type::bits(mask) {
            for age_id in 0u8..=16 {
                let bucket = AgeBucket::from_id(age_id).expect("0..=16 is always valid");
                if bucket.fits(self.ref_time, atime_in, record.mtime) {
                    top.add(
                        record.gid,
                        record.uid,
                        ft,
                        age_id,
                        1,
                        record.apparent_size,
                        atime_in,
                        record.mtime,
                    );
                }
            }
        }

        self.current = target_id;

        if is_dir {
            self.close_current()?;
        }
        Ok(())
    }

    fn ascend_to_common_ancestor(&mut self, target_id: PathId) -> Result<(), DgutaError> {
        let lca = self.interner.common_ancestor(self.current, target_id);
        while self.stack.len() > 1 && self.interner.depth(self.stack.last().unwrap().path_id) > self.interner.depth(lca) {
            self.close_current()?;
        }
        Ok(())
    }

    fn descend_to(&mut self, target_id: PathId) -> Result<(), DgutaError> {
        if self.stack.last().unwrap().path_id == target_id {
            return Ok(());
        }
        let mut chain: Vec<PathId> = Vec::new();
        let current_depth = self.interner.depth(self.stack.last().unwrap().path_id);
        let mut cursor = target_id;
        loop {
            if self.interner.depth(cursor) <= current_depth {
                break;
            }
            chain.push(cursor);
            cursor = self.interner.parent(cursor).unwrap_or(self.interner.root());
        }
        if cursor != self.stack.last().unwrap().path_id {
            return Err(DgutaError::OutOfOrder(self.interner.path_string(target_id)));
        }
        for id in chain.into_iter().rev() {
            if self.finalized.contains(&id) {
                return Err(DgutaError::OutOfOrder(self.interner.path_string(id)));
            }
            let name = self.interner.name(id).to_string();
            self.stack.last_mut().unwrap().children.push(name);
            self.stack.push(Frame::new(id));
        }
        Ok(())
    }

    fn close_current(&mut self) -> Result<(), DgutaError> {
        let frame = self.stack.pop().expect("caller checked len > 1 or root close");
        let path_id = frame.path_id;
        let dir_path = self.interner.path_string(path_id);
        let gutas = Frame {
            path_id,
            map: frame.map.clone(),
            children: Vec::new(),
        }
        .into_gutas();
        self.sink.emit(&dir_path, &gutas, &frame.children)?;
        self.finalized.insert(path_id);
        if let Some(parent) = self.stack.last_mut() {
            frame.fold_into(parent);
        }
        Ok(())
    }

    /// Flush remaining open frames, deepest first, including the root
    /// (unless the input already carried an explicit root record and
    /// closed it itself).
    pub fn finish(mut self) -> Result<(), DgutaError> {
        while self.stack.len() > 1 {
            self.close_current()?;
        }
        if let Some(root) = self.stack.pop() {
            let dir_path = self.interner.path_string(root.path_id);
            let gutas = Frame {
                path_id: root.path_id,
                map: root.map,
                children: Vec::new(),
            }
            .into_gutas();
            self.sink.emit(&dir_path, &gutas, &root.children)?;
        }
        Ok(())
    }
}
