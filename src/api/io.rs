//! Line and binary file input/output.
//!
//! `read_lines` splits the globbed input's global byte space evenly over
//! workers and aligns the split to line boundaries: a line belongs to the
//! range containing its first byte, so each worker skips the partial line
//! at its range start and reads past its range end to finish the last
//! line it owns. Non-seekable (compressed) files are indivisible and are
//! assigned wholly to the worker owning their first byte.
//!
//! `write_binary`/`read_binary` persist items in the engine's block
//! layout: each block is prefixed by the wire header (with the rank
//! fields zero), and an index footer records per-block
//! `(offset, size, num_items, first_item)` so items can be located
//! without deserializing the payloads.

use crate::api::actions::run_write_action;
use crate::api::context::Context;
use crate::api::dia::{Dia, Item};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::common::{local_range, NodeId};
use crate::data::block::Block;
use crate::data::multiplexer::{StreamBlockHeader, HEADER_BYTES};
use crate::data::reader::{BlockReader, BlockSource};
use crate::data::writer::{BlockSink, BlockWriter};
use crate::error::{Error, Result};
use crate::vfs::{fill_file_pattern, glob_files, ReadStream, WriteStream};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::rc::Rc;

const BINARY_MAGIC: u64 = 0x6d69_6c6c_7261_6365;

/// One worker's share of one input file, in file-local byte offsets.
struct LinePart {
    path: PathBuf,
    from: u64,
    to: u64,
    whole: bool,
}

struct ReadLinesNode {
    base: NodeBase<String>,
    parts: Vec<LinePart>,
}

impl NodeImpl for ReadLinesNode {
    type Out = String;

    fn base(&self) -> &NodeBase<String> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        Ok(())
    }

    fn push_data_impl(&self, child: NodeId, _consume: bool) -> Result<()> {
        self.base.push_with(child, |emit| {
            for part in &self.parts {
                read_part(part, emit)?;
            }
            Ok(())
        })
    }

    fn keep(&self) -> bool {
        // Re-reads the files on every push; nothing to dispose.
        true
    }
}

fn read_part(part: &LinePart, emit: &mut dyn FnMut(String)) -> Result<()> {
    let mut stream = ReadStream::open(&part.path)?;
    let mut pos = 0u64;
    if !part.whole && part.from > 0 {
        // Seek one byte early and discard up to the next newline; this
        // lands exactly at `from` when the preceding byte is a newline.
        stream.lseek(part.from - 1)?;
        pos = part.from - 1;
    }
    let mut reader = BufReader::new(stream);
    if !part.whole && part.from > 0 {
        let mut skipped = Vec::new();
        pos += reader.read_until(b'\n', &mut skipped)? as u64;
    }
    let mut buf = Vec::new();
    loop {
        if !part.whole && pos >= part.to {
            break;
        }
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        pos += n as u64;
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8(std::mem::take(&mut buf))
            .map_err(|e| Error::Decode(format!("invalid UTF-8 in line input: {e}")))?;
        emit(line);
    }
    Ok(())
}

/// Read all lines of the files matching `pattern`, split evenly across
/// workers by byte range.
pub fn read_lines(ctx: &Context, pattern: &str) -> Result<Dia<String>> {
    let list = glob_files(pattern)?;
    let total = list.total_size as usize;
    let range = local_range(total, ctx.num_workers(), ctx.global_rank());
    let (rb, re) = (range.begin as u64, range.end as u64);

    let mut parts = Vec::new();
    for f in &list.files {
        if f.size == 0 {
            continue;
        }
        let (fs, fe) = (f.size_prefix, f.size_prefix + f.size);
        if !f.can_seek {
            // Indivisible: owned by the worker whose range contains the
            // first byte.
            if rb <= fs && fs < re {
                parts.push(LinePart {
                    path: f.path.clone(),
                    from: 0,
                    to: f.size,
                    whole: true,
                });
            }
            continue;
        }
        let from = rb.max(fs);
        let to = re.min(fe);
        if from < to {
            parts.push(LinePart {
                path: f.path.clone(),
                from: from - fs,
                to: to - fs,
                whole: false,
            });
        }
    }

    let node = Rc::new(ReadLinesNode {
        base: NodeBase::new(ctx.new_node_id(), "read_lines", vec![]),
        parts,
    });
    Ok(Dia::from_node(ctx.clone(), node))
}

struct BlockListSource(VecDeque<Block>);

impl BlockSource for BlockListSource {
    fn next_block(&mut self) -> Result<Option<Block>> {
        Ok(self.0.pop_front())
    }
}

struct ReadBinaryNode<T: Item> {
    base: NodeBase<T>,
    ctx: Context,
    paths: Vec<PathBuf>,
}

impl<T: Item> NodeImpl for ReadBinaryNode<T> {
    type Out = T;

    fn base(&self) -> &NodeBase<T> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        Ok(())
    }

    fn push_data_impl(&self, child: NodeId, _consume: bool) -> Result<()> {
        self.base.push_with(child, |emit| {
            for path in &self.paths {
                let bytes = std::fs::read(path)?;
                let blocks = parse_binary_file(&bytes, &self.ctx)?;
                let mut reader = BlockReader::new(BlockListSource(blocks));
                while reader.has_next()? {
                    emit(reader.next::<T>()?);
                }
            }
            Ok(())
        })
    }

    fn keep(&self) -> bool {
        true
    }
}

fn parse_binary_file(bytes: &[u8], ctx: &Context) -> Result<VecDeque<Block>> {
    let u64_at = |o: usize| -> Result<u64> {
        let slice = bytes
            .get(o..o + 8)
            .ok_or_else(|| Error::Decode("truncated binary file".into()))?;
        Ok(u64::from_ne_bytes(slice.try_into().expect("8 bytes")))
    };
    if bytes.len() < 16 {
        return Err(Error::Decode("binary file too short".into()));
    }
    if u64_at(bytes.len() - 8)? != BINARY_MAGIC {
        return Err(Error::Decode("bad binary file magic".into()));
    }
    let num_blocks = u64_at(bytes.len() - 16)? as usize;
    let index_start = bytes
        .len()
        .checked_sub(16 + 32 * num_blocks)
        .ok_or_else(|| Error::Decode("truncated binary index".into()))?;

    let mut blocks = VecDeque::with_capacity(num_blocks);
    for i in 0..num_blocks {
        let e = index_start + 32 * i;
        let offset = u64_at(e)? as usize;
        let size = u64_at(e + 8)? as usize;
        let num_items = u64_at(e + 16)? as usize;
        let first_item = u64_at(e + 24)? as usize;
        let payload = bytes
            .get(offset..offset + size)
            .ok_or_else(|| Error::Decode("block payload out of bounds".into()))?;
        blocks.push_back(
            ctx.pool()
                .allocate_block(payload.to_vec(), first_item, num_items)?,
        );
    }
    Ok(blocks)
}

/// Read items previously persisted with
/// [`write_binary`](Dia::write_binary); whole files are distributed
/// round-robin over workers.
pub fn read_binary<T: Item>(ctx: &Context, pattern: &str) -> Result<Dia<T>> {
    let list = glob_files(pattern)?;
    let workers = ctx.num_workers();
    let paths = list
        .files
        .iter()
        .enumerate()
        .filter(|(i, _)| i % workers == ctx.global_rank())
        .map(|(_, f)| f.path.clone())
        .collect();
    let node = Rc::new(ReadBinaryNode {
        base: NodeBase::new(ctx.new_node_id(), "read_binary", vec![]),
        ctx: ctx.clone(),
        paths,
    });
    Ok(Dia::from_node(ctx.clone(), node))
}

/// Sink collecting sealed blocks in memory for the binary writer.
struct CollectSink {
    blocks: Rc<RefCell<Vec<Block>>>,
}

impl BlockSink for CollectSink {
    fn append_block(&mut self, block: Block) -> Result<()> {
        self.blocks.borrow_mut().push(block);
        Ok(())
    }

    fn close_sink(&mut self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn write_binary<T: Item>(dia: &Dia<T>, pattern: &str) -> Result<()> {
    let ctx = dia.ctx().clone();
    let path = fill_file_pattern(pattern, ctx.global_rank());
    let blocks: Rc<RefCell<Vec<Block>>> = Rc::new(RefCell::new(Vec::new()));
    let writer = Rc::new(RefCell::new(BlockWriter::new(
        CollectSink {
            blocks: Rc::clone(&blocks),
        },
        ctx.pool().clone(),
    )));
    let err = ErrorSlot::new();
    let err_pre = err.clone();
    let w = Rc::clone(&writer);

    run_write_action(
        dia,
        "write_binary",
        Box::new(move |item: T| {
            if let Err(e) = w.borrow_mut().put(&item) {
                err_pre.record(e);
            }
        }),
        Box::new(move || {
            writer.borrow_mut().close()?;
            let mut out = WriteStream::create(&path)?;
            let mut index = Vec::new();
            let mut offset = 0u64;
            for block in blocks.borrow().iter() {
                let header = StreamBlockHeader {
                    stream_id: 0,
                    payload_size: block.size() as u64,
                    first_item: block.first_item() as u64,
                    num_items: block.num_items() as u64,
                    sender_rank: 0,
                    receiver_local_worker: 0,
                    sender_local_worker: 0,
                };
                let mut head = Vec::with_capacity(HEADER_BYTES);
                header.write_to(&mut head);
                out.write_all(&head)?;
                let pinned = block.pin()?;
                let payload_offset = offset + HEADER_BYTES as u64;
                out.write_all(&pinned.data()[block.begin()..block.end()])?;
                index.push((
                    payload_offset,
                    block.size() as u64,
                    block.num_items() as u64,
                    block.first_item() as u64,
                ));
                offset = payload_offset + block.size() as u64;
            }
            let mut footer = Vec::with_capacity(32 * index.len() + 16);
            for (off, size, num_items, first_item) in &index {
                footer.extend_from_slice(&off.to_ne_bytes());
                footer.extend_from_slice(&size.to_ne_bytes());
                footer.extend_from_slice(&num_items.to_ne_bytes());
                footer.extend_from_slice(&first_item.to_ne_bytes());
            }
            footer.extend_from_slice(&(index.len() as u64).to_ne_bytes());
            footer.extend_from_slice(&BINARY_MAGIC.to_ne_bytes());
            out.write_all(&footer)?;
            out.close()
        }),
        err,
    )
}

pub(crate) fn write_lines_many<T>(dia: &Dia<T>, pattern: &str) -> Result<()>
where
    T: Item + AsRef<str>,
{
    let ctx = dia.ctx().clone();
    let path = fill_file_pattern(pattern, ctx.global_rank());
    let out: Rc<RefCell<Option<WriteStream>>> = Rc::new(RefCell::new(None));
    let err = ErrorSlot::new();
    let err_pre = err.clone();
    let out_pre = Rc::clone(&out);
    let path_pre = path.clone();

    run_write_action(
        dia,
        "write_lines_many",
        Box::new(move |item: T| {
            let mut slot = out_pre.borrow_mut();
            if slot.is_none() {
                match WriteStream::create(&path_pre) {
                    Ok(s) => *slot = Some(s),
                    Err(e) => {
                        err_pre.record(e);
                        return;
                    }
                }
            }
            let stream = slot.as_mut().expect("stream just created");
            if let Err(e) = stream
                .write_all(item.as_ref().as_bytes())
                .and_then(|()| stream.write_all(b"\n"))
            {
                err_pre.record(e);
            }
        }),
        Box::new(move || {
            // Workers without items still produce an (empty) file.
            let stream = match out.borrow_mut().take() {
                Some(s) => s,
                None => WriteStream::create(&path)?,
            };
            stream.close()
        }),
        err,
    )
}

pub(crate) fn write_lines<T>(dia: &Dia<T>, path: &str) -> Result<()>
where
    T: Item + AsRef<str>,
{
    let ctx = dia.ctx().clone();
    let stream = ctx.new_cat_stream().expect("allocate write stream");
    let writers = Rc::new(RefCell::new(
        stream.open_writers().expect("open write stream"),
    ));
    let path = PathBuf::from(path);
    let err = ErrorSlot::new();
    let err_pre = err.clone();
    let w = Rc::clone(&writers);

    run_write_action(
        dia,
        "write_lines",
        Box::new(move |item: T| {
            // Everything funnels to worker 0, which writes the file.
            if let Err(e) = w.borrow_mut()[0].put(&item.as_ref().to_string()) {
                err_pre.record(e);
            }
        }),
        Box::new(move || {
            for writer in writers.borrow_mut().iter_mut() {
                writer.close()?;
            }
            if ctx.global_rank() == 0 {
                let mut out = WriteStream::create(&path)?;
                let mut reader = stream.reader();
                while reader.has_next()? {
                    let line: String = reader.next()?;
                    out.write_all(line.as_bytes())?;
                    out.write_all(b"\n")?;
                }
                out.close()?;
            }
            Ok(())
        }),
        err,
    )
}
