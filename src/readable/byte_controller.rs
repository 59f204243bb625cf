use std::{
    cell::Cell,
    collections::VecDeque,
    rc::Rc,
};

use crate::{
    error::StreamError,
    readable::{
        source::ByteSourceAlgorithms, ControllerState, PullState, ReadIntoRequest, ReadRequest,
        ReadableCore, ReadableInner, ReadableState, ReaderState,
    },
    utils::reactor::upon_future,
    StreamResult,
};

/// The element width a [`ByteView`] is typed with. Reads through a BYOB
/// reader only complete on element boundaries of the supplied view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewKind {
    U8,
    U16,
    U32,
    U64,
}

impl ViewKind {
    pub fn element_size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

/// A typed window over an owned byte buffer, the chunk type of byte streams.
///
/// Passing a `ByteView` to the engine (enqueue, BYOB reads, responding)
/// transfers ownership of the whole underlying buffer; it comes back in the
/// view the engine eventually delivers. This is the single-owner stand-in for
/// `ArrayBuffer` transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteView {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
    kind: ViewKind,
}

impl ByteView {
    /// A `U8` view covering the whole buffer.
    pub fn uint8(buffer: Vec<u8>) -> Self {
        let byte_length = buffer.len();
        Self {
            buffer,
            byte_offset: 0,
            byte_length,
            kind: ViewKind::U8,
        }
    }

    /// A view of `kind` covering the whole buffer.
    pub fn new(buffer: Vec<u8>, kind: ViewKind) -> StreamResult<Self> {
        let byte_length = buffer.len();
        Self::with_range(buffer, 0, byte_length, kind)
    }

    /// A view over `buffer[byte_offset..byte_offset + byte_length]`.
    pub fn with_range(
        buffer: Vec<u8>,
        byte_offset: usize,
        byte_length: usize,
        kind: ViewKind,
    ) -> StreamResult<Self> {
        let element_size = kind.element_size();
        if byte_offset % element_size != 0 {
            return Err(StreamError::range_error(
                "start offset of view must be a multiple of its element size",
            ));
        }
        if byte_length % element_size != 0 {
            return Err(StreamError::range_error(
                "byte length of view must be a multiple of its element size",
            ));
        }
        if byte_offset.checked_add(byte_length).map_or(true, |end| end > buffer.len()) {
            return Err(StreamError::range_error(
                "view is outside the bounds of its buffer",
            ));
        }
        Ok(Self {
            buffer,
            byte_offset,
            byte_length,
            kind,
        })
    }

    pub(crate) fn from_parts(
        buffer: Vec<u8>,
        byte_offset: usize,
        byte_length: usize,
        kind: ViewKind,
    ) -> Self {
        debug_assert!(byte_offset + byte_length <= buffer.len());
        Self {
            buffer,
            byte_offset,
            byte_length,
            kind,
        }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Number of elements (not bytes) in the view.
    pub fn len(&self) -> usize {
        self.byte_length / self.kind.element_size()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length == 0
    }

    /// Capacity of the underlying buffer, independent of the viewed region.
    pub fn buffer_byte_length(&self) -> usize {
        self.buffer.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Recovers the whole underlying buffer.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    pub(crate) fn into_raw_parts(self) -> (Vec<u8>, usize, usize, ViewKind) {
        (self.buffer, self.byte_offset, self.byte_length, self.kind)
    }
}

/// Which kind of read a pending pull-into descriptor will fulfill. `None`
/// marks a descriptor orphaned by a reader release; its bytes are salvaged
/// into the queue instead of being delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReaderKind {
    Default,
    Byob,
    None,
}

/// https://streams.spec.whatwg.org/#pull-into-descriptor
pub(crate) struct PullIntoDescriptor {
    pub buffer: Vec<u8>,
    pub buffer_byte_length: usize,
    pub byte_offset: usize,
    pub byte_length: usize,
    pub bytes_filled: usize,
    pub minimum_fill: usize,
    pub element_size: usize,
    pub view_kind: ViewKind,
    pub reader_kind: ReaderKind,
}

/// The byte controller's queue: whole enqueued chunks plus a cursor into the
/// head chunk, so partial BYOB fills never reallocate the remainder.
pub(crate) struct ByteChunkQueue {
    chunks: VecDeque<Vec<u8>>,
    head_offset: usize,
    total_size: usize,
}

impl ByteChunkQueue {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            head_offset: 0,
            total_size: 0,
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }

    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.total_size += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Removes and returns the unconsumed remainder of the head chunk.
    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.pop_front()?;
        let offset = std::mem::replace(&mut self.head_offset, 0);
        self.total_size -= chunk.len() - offset;
        if offset == 0 {
            Some(chunk)
        } else {
            Some(chunk[offset..].to_vec())
        }
    }

    /// Copies up to `dest.len()` bytes into `dest`, consuming them.
    pub fn fill_into(&mut self, mut dest: &mut [u8]) -> usize {
        let mut copied = 0;
        while !dest.is_empty() {
            let Some(chunk) = self.chunks.front() else {
                break;
            };
            let available = &chunk[self.head_offset..];
            let n = available.len().min(dest.len());
            dest[..n].copy_from_slice(&available[..n]);
            dest = &mut dest[n..];
            copied += n;
            self.total_size -= n;
            if n == available.len() {
                self.chunks.pop_front();
                self.head_offset = 0;
            } else {
                self.head_offset += n;
            }
        }
        copied
    }

    pub fn reset(&mut self) {
        self.chunks.clear();
        self.head_offset = 0;
        self.total_size = 0;
    }
}

/// https://streams.spec.whatwg.org/#rbs-controller-class
pub(crate) struct ByteControllerState<T> {
    pub queue: ByteChunkQueue,
    pub pending_pull_intos: VecDeque<PullIntoDescriptor>,
    pub started: bool,
    pub close_requested: bool,
    pub pull_state: PullState,
    pub strategy_hwm: f64,
    pub auto_allocate_chunk_size: Option<usize>,
    /// Validity token of the currently handed-out BYOB request, if any.
    pub byob_request_token: Option<Rc<Cell<bool>>>,
    pub algorithms: Option<ByteSourceAlgorithms>,
    /// Converts delivered views into the stream's chunk type; the identity
    /// function on byte streams proper.
    pub into_chunk: fn(ByteView) -> T,
}

impl<T> ByteControllerState<T> {
    pub fn new(
        strategy_hwm: f64,
        auto_allocate_chunk_size: Option<usize>,
        into_chunk: fn(ByteView) -> T,
    ) -> Self {
        Self {
            queue: ByteChunkQueue::new(),
            pending_pull_intos: VecDeque::new(),
            started: false,
            close_requested: false,
            pull_state: PullState::Idle,
            strategy_hwm,
            auto_allocate_chunk_size,
            byob_request_token: None,
            algorithms: None,
            into_chunk,
        }
    }

    /// https://streams.spec.whatwg.org/#readable-byte-stream-controller-invalidate-byob-request
    pub fn invalidate_byob_request(&mut self) {
        if let Some(token) = self.byob_request_token.take() {
            token.set(false);
        }
    }

    /// https://streams.spec.whatwg.org/#readable-byte-stream-controller-clear-pending-pull-intos
    pub fn clear_pending_pull_intos(&mut self) {
        self.invalidate_byob_request();
        self.pending_pull_intos.clear();
    }

    fn shift_pending_pull_into(&mut self) -> PullIntoDescriptor {
        self.invalidate_byob_request();
        self.pending_pull_intos
            .pop_front()
            .expect("shift on empty pending pull-intos")
    }

    /// Salvages the filled prefix of an orphaned head descriptor into the
    /// queue and discards the descriptor.
    /// https://streams.spec.whatwg.org/#readable-byte-stream-controller-enqueue-detached-pull-into-to-queue
    fn enqueue_detached_head(&mut self) {
        let head = self
            .pending_pull_intos
            .front()
            .expect("detached head on empty pending pull-intos");
        debug_assert_eq!(head.reader_kind, ReaderKind::None);
        if head.bytes_filled > 0 {
            let start = head.byte_offset;
            let cloned = head.buffer[start..start + head.bytes_filled].to_vec();
            self.queue.push(cloned);
        }
        self.shift_pending_pull_into();
    }
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-fill-pull-into-descriptor-from-queue
fn fill_pull_into_from_queue(queue: &mut ByteChunkQueue, desc: &mut PullIntoDescriptor) -> bool {
    let max_bytes_to_copy = queue.total_size().min(desc.byte_length - desc.bytes_filled);
    let max_bytes_filled = desc.bytes_filled + max_bytes_to_copy;
    let mut total_to_copy = max_bytes_to_copy;
    let mut ready = false;

    let max_aligned = max_bytes_filled - (max_bytes_filled % desc.element_size);
    if max_aligned >= desc.minimum_fill {
        ready = true;
        total_to_copy = max_aligned - desc.bytes_filled;
    }

    let start = desc.byte_offset + desc.bytes_filled;
    let copied = queue.fill_into(&mut desc.buffer[start..start + total_to_copy]);
    debug_assert_eq!(copied, total_to_copy);
    desc.bytes_filled += copied;
    ready
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-convert-pull-into-descriptor
fn convert_pull_into_descriptor(desc: PullIntoDescriptor) -> ByteView {
    debug_assert_eq!(desc.bytes_filled % desc.element_size, 0);
    debug_assert!(desc.bytes_filled <= desc.byte_length);
    ByteView::from_parts(desc.buffer, desc.byte_offset, desc.bytes_filled, desc.view_kind)
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-commit-pull-into-descriptor
fn commit_pull_into_descriptor<T: 'static>(core: &mut ReadableCore<T>, desc: PullIntoDescriptor) {
    debug_assert_ne!(desc.reader_kind, ReaderKind::None);
    let done = matches!(core.state, ReadableState::Closed);
    let reader_kind = desc.reader_kind;
    let view = convert_pull_into_descriptor(desc);
    match reader_kind {
        ReaderKind::Default => {
            let ControllerState::Byte(c) = &core.controller else {
                return;
            };
            let into_chunk = c.into_chunk;
            ReadableInner::fulfill_read_request(core, into_chunk(view), done);
        }
        ReaderKind::Byob => ReadableInner::fulfill_read_into_request(core, view, done),
        ReaderKind::None => {}
    }
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-process-pull-into-descriptors-using-queue
fn process_pull_intos<T: 'static>(core: &mut ReadableCore<T>) {
    loop {
        let desc = {
            let ControllerState::Byte(c) = &mut core.controller else {
                return;
            };
            debug_assert!(!c.close_requested || c.pending_pull_intos.is_empty() || c.queue.is_empty());
            if c.queue.total_size() == 0 {
                return;
            }
            let ByteControllerState {
                queue,
                pending_pull_intos,
                ..
            } = c;
            let Some(head) = pending_pull_intos.front_mut() else {
                return;
            };
            if !fill_pull_into_from_queue(queue, head) {
                return;
            }
            c.shift_pending_pull_into()
        };
        commit_pull_into_descriptor(core, desc);
    }
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-handle-queue-drain
fn handle_queue_drain<T: 'static>(core: &mut ReadableCore<T>) {
    let ControllerState::Byte(c) = &mut core.controller else {
        return;
    };
    if c.queue.is_empty() && c.close_requested {
        c.algorithms = None;
        ReadableInner::close(core);
    }
}

fn desired_size<T>(state: &ReadableState, c: &ByteControllerState<T>) -> Option<f64> {
    match state {
        ReadableState::Errored(_) => None,
        ReadableState::Closed => Some(0.0),
        ReadableState::Readable => Some(c.strategy_hwm - c.queue.total_size() as f64),
    }
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-should-call-pull
fn should_call_pull<T: 'static>(core: &ReadableCore<T>, c: &ByteControllerState<T>) -> bool {
    if !core.state.is_readable() || c.close_requested || !c.started {
        return false;
    }
    if ReadableInner::has_default_reader(core) && ReadableInner::num_read_requests(core) > 0 {
        return true;
    }
    if ReadableInner::has_byob_reader(core) && ReadableInner::num_read_into_requests(core) > 0 {
        return true;
    }
    desired_size(&core.state, c).expect("desired size of a readable stream") > 0.0
}

pub(crate) fn mark_started<T: 'static>(inner: &Rc<ReadableInner<T>>) {
    let mut core = inner.core.borrow_mut();
    if let ControllerState::Byte(c) = &mut core.controller {
        c.started = true;
    }
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-call-pull-if-needed
pub(crate) fn pull_if_needed<T: 'static>(inner: &Rc<ReadableInner<T>>) {
    let algorithms = {
        let mut core = inner.core.borrow_mut();
        let core = &mut *core;
        {
            let ControllerState::Byte(c) = &core.controller else {
                return;
            };
            if !should_call_pull(core, c) {
                return;
            }
        }
        let ControllerState::Byte(c) = &mut core.controller else {
            return;
        };
        match c.pull_state {
            PullState::Idle => c.pull_state = PullState::InFlight,
            PullState::InFlight | PullState::InFlightAndQueued => {
                c.pull_state = PullState::InFlightAndQueued;
                return;
            }
        }
        match &c.algorithms {
            Some(algorithms) => algorithms.clone(),
            None => return,
        }
    };

    let fut = (algorithms.pull)();
    let reactor = inner.reactor.clone();
    let inner = Rc::clone(inner);
    upon_future(&reactor, fut, move |outcome| match outcome {
        Ok(()) => {
            let pull_again = {
                let mut core = inner.core.borrow_mut();
                let ControllerState::Byte(c) = &mut core.controller else {
                    return;
                };
                let again = c.pull_state == PullState::InFlightAndQueued;
                c.pull_state = PullState::Idle;
                again
            };
            if pull_again {
                pull_if_needed(&inner);
            }
        }
        Err(error) => self::error(&inner, error),
    });
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-error
pub(crate) fn error_with<T: 'static>(core: &mut ReadableCore<T>, error: StreamError) {
    if !core.state.is_readable() {
        return;
    }
    if let ControllerState::Byte(c) = &mut core.controller {
        c.clear_pending_pull_intos();
        c.queue.reset();
        c.algorithms = None;
    }
    ReadableInner::error(core, error);
}

pub(crate) fn error<T: 'static>(inner: &Rc<ReadableInner<T>>, error: StreamError) {
    error_with(&mut inner.core.borrow_mut(), error);
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-close
pub(crate) fn close<T: 'static>(inner: &Rc<ReadableInner<T>>) -> StreamResult<()> {
    let mut core = inner.core.borrow_mut();
    let core = &mut *core;
    let ControllerState::Byte(c) = &mut core.controller else {
        return Err(StreamError::type_error("not a byte stream controller"));
    };
    if c.close_requested || !core.state.is_readable() {
        return Err(StreamError::type_error(
            "The stream is not in a state that permits close",
        ));
    }
    if c.queue.total_size() > 0 {
        c.close_requested = true;
        return Ok(());
    }
    let partial_head = c
        .pending_pull_intos
        .front()
        .is_some_and(|head| head.bytes_filled % head.element_size != 0);
    if partial_head {
        let error = StreamError::type_error(
            "Insufficient bytes to fill elements in the given buffer",
        );
        error_with(core, error.clone());
        return Err(error);
    }
    c.algorithms = None;
    ReadableInner::close(core);
    Ok(())
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-enqueue
pub(crate) fn enqueue<T: 'static>(inner: &Rc<ReadableInner<T>>, chunk: ByteView) -> StreamResult<()> {
    {
        let mut core = inner.core.borrow_mut();
        let core = &mut *core;
        let ControllerState::Byte(c) = &mut core.controller else {
            return Err(StreamError::type_error("not a byte stream controller"));
        };
        if c.close_requested || !core.state.is_readable() {
            return Err(StreamError::type_error(
                "The stream is not in a state that permits enqueue",
            ));
        }
        if chunk.byte_length() == 0 {
            return Err(StreamError::type_error("chunk must have non-zero byteLength"));
        }
        let (buffer, byte_offset, byte_length, _) = chunk.into_raw_parts();
        let region = if byte_offset == 0 && byte_length == buffer.len() {
            buffer
        } else {
            buffer[byte_offset..byte_offset + byte_length].to_vec()
        };

        if !c.pending_pull_intos.is_empty() {
            c.invalidate_byob_request();
            if c.pending_pull_intos[0].reader_kind == ReaderKind::None {
                c.enqueue_detached_head();
            }
        }

        let has_default = ReadableInner::has_default_reader(core);
        let has_byob = ReadableInner::has_byob_reader(core);
        let pending_reads = ReadableInner::num_read_requests(core);
        let ControllerState::Byte(c) = &mut core.controller else {
            unreachable!()
        };
        if has_default {
            if pending_reads == 0 {
                debug_assert!(c.pending_pull_intos.is_empty());
                c.queue.push(region);
            } else {
                debug_assert!(c.queue.is_empty());
                if !c.pending_pull_intos.is_empty() {
                    debug_assert_eq!(c.pending_pull_intos[0].reader_kind, ReaderKind::Default);
                    c.shift_pending_pull_into();
                }
                let into_chunk = c.into_chunk;
                let view = ByteView::uint8(region);
                ReadableInner::fulfill_read_request(core, into_chunk(view), false);
            }
        } else if has_byob {
            c.queue.push(region);
            process_pull_intos(core);
        } else {
            c.queue.push(region);
        }
    }
    pull_if_needed(inner);
    Ok(())
}

/// Default-reader [[PullSteps]] for byte streams: serve straight from the
/// queue, otherwise park the request (auto-allocating a buffer if the source
/// asked for that).
/// https://streams.spec.whatwg.org/#rbs-controller-private-pull
pub(crate) fn pull_steps<T: 'static>(inner: &Rc<ReadableInner<T>>, request: Box<dyn ReadRequest<T>>) {
    {
        let mut core = inner.core.borrow_mut();
        let core = &mut *core;
        let num_read_requests = ReadableInner::num_read_requests(core);
        let ControllerState::Byte(c) = &mut core.controller else {
            return;
        };
        if c.queue.total_size() > 0 {
            debug_assert_eq!(num_read_requests, 0);
            let bytes = c.queue.pop_front().expect("non-empty byte queue");
            let into_chunk = c.into_chunk;
            handle_queue_drain(core);
            request.chunk_steps(into_chunk(ByteView::uint8(bytes)));
        } else {
            if let Some(size) = c.auto_allocate_chunk_size {
                c.pending_pull_intos.push_back(PullIntoDescriptor {
                    buffer: vec![0; size],
                    buffer_byte_length: size,
                    byte_offset: 0,
                    byte_length: size,
                    bytes_filled: 0,
                    minimum_fill: 1,
                    element_size: 1,
                    view_kind: ViewKind::U8,
                    reader_kind: ReaderKind::Default,
                });
            }
            let Some(ReaderState::Default(reader)) = core.reader.as_mut() else {
                panic!("byte pull steps without a default reader");
            };
            reader.read_requests.push_back(request);
        }
    }
    pull_if_needed(inner);
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-pull-into
pub(crate) fn pull_into<T: 'static>(
    inner: &Rc<ReadableInner<T>>,
    view: ByteView,
    min: usize,
    request: Box<dyn ReadIntoRequest>,
) {
    {
        let mut core = inner.core.borrow_mut();
        let core = &mut *core;
        let ControllerState::Byte(c) = &mut core.controller else {
            request.error_steps(StreamError::type_error("not a byte stream controller"));
            return;
        };
        let element_size = view.kind().element_size();
        let minimum_fill = min * element_size;
        debug_assert!(minimum_fill >= element_size && minimum_fill <= view.byte_length());
        let (buffer, byte_offset, byte_length, view_kind) = view.into_raw_parts();
        let mut desc = PullIntoDescriptor {
            buffer_byte_length: buffer.len(),
            buffer,
            byte_offset,
            byte_length,
            bytes_filled: 0,
            minimum_fill,
            element_size,
            view_kind,
            reader_kind: ReaderKind::Byob,
        };

        if !c.pending_pull_intos.is_empty() {
            c.pending_pull_intos.push_back(desc);
            add_read_into_request(core, request);
            return;
        }
        if matches!(core.state, ReadableState::Closed) {
            let empty =
                ByteView::from_parts(desc.buffer, desc.byte_offset, 0, desc.view_kind);
            request.close_steps(Some(empty));
            return;
        }
        if c.queue.total_size() > 0 {
            if fill_pull_into_from_queue(&mut c.queue, &mut desc) {
                let filled = convert_pull_into_descriptor(desc);
                handle_queue_drain(core);
                request.chunk_steps(filled);
            } else if c.close_requested {
                let error = StreamError::type_error(
                    "Insufficient bytes to fill elements in the given buffer",
                );
                error_with(core, error.clone());
                request.error_steps(error);
                return;
            } else {
                c.pending_pull_intos.push_back(desc);
                add_read_into_request(core, request);
            }
        } else {
            c.pending_pull_intos.push_back(desc);
            add_read_into_request(core, request);
        }
    }
    pull_if_needed(inner);
}

fn add_read_into_request<T>(core: &mut ReadableCore<T>, request: Box<dyn ReadIntoRequest>) {
    let Some(ReaderState::Byob(reader)) = core.reader.as_mut() else {
        panic!("read-into request without a BYOB reader");
    };
    reader.read_into_requests.push_back(request);
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-respond
pub(crate) fn respond<T: 'static>(inner: &Rc<ReadableInner<T>>, bytes_written: usize) -> StreamResult<()> {
    {
        let mut core = inner.core.borrow_mut();
        let core = &mut *core;
        let ControllerState::Byte(c) = &mut core.controller else {
            return Err(StreamError::type_error("not a byte stream controller"));
        };
        let Some(head) = c.pending_pull_intos.front() else {
            return Err(StreamError::type_error("This BYOB request has been invalidated"));
        };
        match &core.state {
            ReadableState::Closed => {
                if bytes_written != 0 {
                    return Err(StreamError::type_error(
                        "bytesWritten must be 0 when calling respond() on a closed stream",
                    ));
                }
            }
            _ => {
                if bytes_written == 0 {
                    return Err(StreamError::type_error(
                        "bytesWritten must be greater than 0 when calling respond() on a readable stream",
                    ));
                }
                if head.bytes_filled + bytes_written > head.byte_length {
                    return Err(StreamError::range_error("bytesWritten out of range"));
                }
            }
        }
        respond_internal(core, bytes_written);
    }
    pull_if_needed(inner);
    Ok(())
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-respond-with-new-view
pub(crate) fn respond_with_new_view<T: 'static>(
    inner: &Rc<ReadableInner<T>>,
    view: ByteView,
) -> StreamResult<()> {
    {
        let mut core = inner.core.borrow_mut();
        let core = &mut *core;
        let ControllerState::Byte(c) = &mut core.controller else {
            return Err(StreamError::type_error("not a byte stream controller"));
        };
        let Some(head) = c.pending_pull_intos.front_mut() else {
            return Err(StreamError::type_error("This BYOB request has been invalidated"));
        };
        match &core.state {
            ReadableState::Closed => {
                if view.byte_length() != 0 {
                    return Err(StreamError::type_error(
                        "The view's length must be 0 when calling respondWithNewView() on a closed stream",
                    ));
                }
            }
            _ => {
                if view.byte_length() == 0 {
                    return Err(StreamError::type_error(
                        "The view's length must be greater than 0 when calling respondWithNewView() on a readable stream",
                    ));
                }
            }
        }
        if view.byte_offset() != head.byte_offset + head.bytes_filled {
            return Err(StreamError::range_error(
                "The region specified by view does not match byobRequest",
            ));
        }
        if view.buffer_byte_length() != head.buffer_byte_length {
            return Err(StreamError::range_error(
                "The buffer of view has different capacity than byobRequest",
            ));
        }
        if head.bytes_filled + view.byte_length() > head.byte_length {
            return Err(StreamError::range_error(
                "The region specified by view is larger than byobRequest",
            ));
        }
        let bytes_written = view.byte_length();
        head.buffer = view.into_buffer();
        respond_internal(core, bytes_written);
    }
    pull_if_needed(inner);
    Ok(())
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-respond-internal
fn respond_internal<T: 'static>(core: &mut ReadableCore<T>, bytes_written: usize) {
    {
        let ControllerState::Byte(c) = &mut core.controller else {
            return;
        };
        c.invalidate_byob_request();
    }
    if core.state.is_readable() {
        respond_in_readable_state(core, bytes_written);
    } else {
        debug_assert_eq!(bytes_written, 0);
        respond_in_closed_state(core);
    }
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-respond-in-closed-state
fn respond_in_closed_state<T: 'static>(core: &mut ReadableCore<T>) {
    {
        let ControllerState::Byte(c) = &mut core.controller else {
            return;
        };
        debug_assert!(c
            .pending_pull_intos
            .front()
            .is_some_and(|head| head.bytes_filled % head.element_size == 0));
        if c.pending_pull_intos
            .front()
            .is_some_and(|head| head.reader_kind == ReaderKind::None)
        {
            c.shift_pending_pull_into();
        }
    }
    if ReadableInner::has_byob_reader(core) {
        while ReadableInner::num_read_into_requests(core) > 0 {
            let desc = {
                let ControllerState::Byte(c) = &mut core.controller else {
                    return;
                };
                if c.pending_pull_intos.is_empty() {
                    break;
                }
                c.shift_pending_pull_into()
            };
            commit_pull_into_descriptor(core, desc);
        }
    }
}

/// https://streams.spec.whatwg.org/#readable-byte-stream-controller-respond-in-readable-state
fn respond_in_readable_state<T: 'static>(core: &mut ReadableCore<T>, bytes_written: usize) {
    enum Action {
        Detached,
        Wait,
        Commit(PullIntoDescriptor),
    }
    let action = {
        let ControllerState::Byte(c) = &mut core.controller else {
            return;
        };
        let Some(head) = c.pending_pull_intos.front_mut() else {
            return;
        };
        debug_assert!(head.bytes_filled + bytes_written <= head.byte_length);
        head.bytes_filled += bytes_written;
        if head.reader_kind == ReaderKind::None {
            c.enqueue_detached_head();
            Action::Detached
        } else if head.bytes_filled < head.minimum_fill {
            Action::Wait
        } else {
            let mut desc = c.shift_pending_pull_into();
            let remainder = desc.bytes_filled % desc.element_size;
            if remainder > 0 {
                // Carry the unaligned tail back into the queue for the next
                // descriptor.
                let end = desc.byte_offset + desc.bytes_filled;
                c.queue.push(desc.buffer[end - remainder..end].to_vec());
                desc.bytes_filled -= remainder;
            }
            Action::Commit(desc)
        }
    };
    match action {
        Action::Wait => {}
        Action::Detached => process_pull_intos(core),
        Action::Commit(desc) => {
            commit_pull_into_descriptor(core, desc);
            process_pull_intos(core);
        }
    }
}

/// Controller [[ReleaseSteps]]: keep only the head descriptor, orphaned, so
/// a respond in flight can still land its bytes in the queue.
/// https://streams.spec.whatwg.org/#abstract-opdef-readablebytestreamcontroller-releasesteps
pub(crate) fn release_steps<T>(core: &mut ReadableCore<T>) {
    let ControllerState::Byte(c) = &mut core.controller else {
        return;
    };
    if !c.pending_pull_intos.is_empty() {
        c.pending_pull_intos.truncate(1);
        c.pending_pull_intos[0].reader_kind = ReaderKind::None;
    }
}

pub(crate) fn has_pending_pull_intos<T>(inner: &Rc<ReadableInner<T>>) -> bool {
    match &inner.core.borrow().controller {
        ControllerState::Byte(c) => !c.pending_pull_intos.is_empty(),
        _ => false,
    }
}

/// Steals the head descriptor's buffer as a `U8` view over its unfilled
/// region, for handing to an upstream BYOB read. The buffer comes back via
/// [`respond_with_new_view`].
pub(crate) fn take_byob_view<T>(inner: &Rc<ReadableInner<T>>) -> Option<ByteView> {
    let mut core = inner.core.borrow_mut();
    let ControllerState::Byte(c) = &mut core.controller else {
        return None;
    };
    let head = c.pending_pull_intos.front_mut()?;
    let buffer = std::mem::take(&mut head.buffer);
    Some(ByteView::from_parts(
        buffer,
        head.byte_offset + head.bytes_filled,
        head.byte_length - head.bytes_filled,
        ViewKind::U8,
    ))
}

/// Handle given to an [`UnderlyingByteSource`]'s start and pull callbacks.
///
/// [`UnderlyingByteSource`]: crate::UnderlyingByteSource
/// https://streams.spec.whatwg.org/#rbs-controller-class
pub struct ReadableByteStreamController {
    pub(crate) inner: Rc<ReadableInner<ByteView>>,
}

impl Clone for ReadableByteStreamController {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl ReadableByteStreamController {
    /// https://streams.spec.whatwg.org/#rbs-controller-desired-size
    pub fn desired_size(&self) -> Option<f64> {
        let core = self.inner.core.borrow();
        match &core.controller {
            ControllerState::Byte(c) => desired_size(&core.state, c),
            ControllerState::Default(_) => None,
        }
    }

    /// https://streams.spec.whatwg.org/#rbs-controller-close
    pub fn close(&self) -> StreamResult<()> {
        close(&self.inner)
    }

    /// https://streams.spec.whatwg.org/#rbs-controller-enqueue
    pub fn enqueue(&self, chunk: ByteView) -> StreamResult<()> {
        enqueue(&self.inner, chunk)
    }

    /// https://streams.spec.whatwg.org/#rbs-controller-error
    pub fn error(&self, error: StreamError) {
        self::error(&self.inner, error);
    }

    /// The outstanding BYOB request, if a read is waiting on a buffer.
    /// https://streams.spec.whatwg.org/#rbs-controller-byob-request
    pub fn byob_request(&self) -> Option<ByobRequest> {
        let mut core = self.inner.core.borrow_mut();
        let ControllerState::Byte(c) = &mut core.controller else {
            return None;
        };
        if c.pending_pull_intos.is_empty() {
            return None;
        }
        let token = c
            .byob_request_token
            .get_or_insert_with(|| Rc::new(Cell::new(true)));
        Some(ByobRequest {
            controller: self.clone(),
            token: Rc::clone(token),
        })
    }
}

/// A request for bytes on behalf of a waiting BYOB (or auto-allocated
/// default) read. Fill the buffer and respond, and the waiting read completes
/// without a copy.
/// https://streams.spec.whatwg.org/#rs-byob-request-class
pub struct ByobRequest {
    controller: ReadableByteStreamController,
    token: Rc<Cell<bool>>,
}

impl ByobRequest {
    /// The request is invalidated once responded to, or when the state it
    /// pointed at is torn down (reader release, cancellation, new chunks).
    pub fn is_valid(&self) -> bool {
        self.token.get()
    }

    /// Bytes of capacity left in the requesting view.
    pub fn remaining(&self) -> usize {
        if !self.token.get() {
            return 0;
        }
        let core = self.controller.inner.core.borrow();
        match &core.controller {
            ControllerState::Byte(c) => c
                .pending_pull_intos
                .front()
                .map_or(0, |head| head.byte_length - head.bytes_filled),
            ControllerState::Default(_) => 0,
        }
    }

    /// Signals that `bytes_written` bytes were produced into the request's
    /// view. `respond(0)` acknowledges a closed stream.
    /// https://streams.spec.whatwg.org/#rs-byob-request-respond
    pub fn respond(&self, bytes_written: usize) -> StreamResult<()> {
        if !self.token.get() {
            return Err(StreamError::type_error("This BYOB request has been invalidated"));
        }
        respond(&self.controller.inner, bytes_written)
    }

    /// Copies `bytes` into the requesting view and responds with their
    /// length.
    pub fn respond_with(&self, bytes: &[u8]) -> StreamResult<()> {
        if !self.token.get() {
            return Err(StreamError::type_error("This BYOB request has been invalidated"));
        }
        {
            let mut core = self.controller.inner.core.borrow_mut();
            let ControllerState::Byte(c) = &mut core.controller else {
                return Err(StreamError::type_error("not a byte stream controller"));
            };
            let Some(head) = c.pending_pull_intos.front_mut() else {
                return Err(StreamError::type_error("This BYOB request has been invalidated"));
            };
            if bytes.len() > head.byte_length - head.bytes_filled {
                return Err(StreamError::range_error("bytesWritten out of range"));
            }
            let start = head.byte_offset + head.bytes_filled;
            head.buffer[start..start + bytes.len()].copy_from_slice(bytes);
        }
        respond(&self.controller.inner, bytes.len())
    }

    /// Responds with a replacement view over the same buffer, as produced by
    /// a BYOB round trip through another stream.
    /// https://streams.spec.whatwg.org/#rs-byob-request-respond-with-new-view
    pub fn respond_with_new_view(&self, view: ByteView) -> StreamResult<()> {
        if !self.token.get() {
            return Err(StreamError::type_error("This BYOB request has been invalidated"));
        }
        respond_with_new_view(&self.controller.inner, view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorName;

    #[test]
    fn byte_queue_fills_across_chunk_boundaries() {
        let mut queue = ByteChunkQueue::new();
        queue.push(vec![1, 2, 3]);
        queue.push(vec![4, 5]);
        assert_eq!(queue.total_size(), 5);

        let mut dest = [0u8; 4];
        assert_eq!(queue.fill_into(&mut dest), 4);
        assert_eq!(dest, [1, 2, 3, 4]);
        assert_eq!(queue.total_size(), 1);

        // The head cursor survives a partial fill.
        assert_eq!(queue.pop_front(), Some(vec![5]));
        assert!(queue.is_empty());
    }

    #[test]
    fn byte_queue_pop_front_respects_cursor() {
        let mut queue = ByteChunkQueue::new();
        queue.push(vec![9, 8, 7, 6]);
        let mut dest = [0u8; 2];
        queue.fill_into(&mut dest);
        assert_eq!(queue.pop_front(), Some(vec![7, 6]));
        assert_eq!(queue.pop_front(), None);
        assert_eq!(queue.total_size(), 0);
    }

    #[test]
    fn fill_descriptor_waits_for_minimum_and_alignment() {
        let mut queue = ByteChunkQueue::new();
        queue.push(vec![1, 2, 3]);
        let mut desc = PullIntoDescriptor {
            buffer: vec![0; 8],
            buffer_byte_length: 8,
            byte_offset: 0,
            byte_length: 8,
            bytes_filled: 0,
            minimum_fill: 4,
            element_size: 4,
            view_kind: ViewKind::U32,
            reader_kind: ReaderKind::Byob,
        };
        // Three bytes cannot complete a u32 element.
        assert!(!fill_pull_into_from_queue(&mut queue, &mut desc));
        assert_eq!(desc.bytes_filled, 3);
        assert!(queue.is_empty());

        queue.push(vec![4, 5]);
        // One more byte completes the element; the fifth stays queued.
        assert!(fill_pull_into_from_queue(&mut queue, &mut desc));
        assert_eq!(desc.bytes_filled, 4);
        assert_eq!(queue.total_size(), 1);
        assert_eq!(&desc.buffer[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn view_validation_checks_bounds_and_alignment() {
        assert!(ByteView::with_range(vec![0; 8], 0, 8, ViewKind::U32).is_ok());
        let err = ByteView::with_range(vec![0; 8], 1, 4, ViewKind::U32).unwrap_err();
        assert_eq!(err.name(), ErrorName::RangeError);
        let err = ByteView::with_range(vec![0; 8], 0, 6, ViewKind::U32).unwrap_err();
        assert_eq!(err.name(), ErrorName::RangeError);
        let err = ByteView::with_range(vec![0; 8], 4, 8, ViewKind::U8).unwrap_err();
        assert_eq!(err.name(), ErrorName::RangeError);
    }

    #[test]
    fn view_exposes_the_selected_region() {
        let mut view = ByteView::with_range(vec![1, 2, 3, 4, 5, 6], 2, 2, ViewKind::U8).unwrap();
        assert_eq!(view.as_slice(), &[3, 4]);
        assert_eq!(view.len(), 2);
        assert_eq!(view.buffer_byte_length(), 6);
        view.as_mut_slice()[0] = 9;
        assert_eq!(view.into_buffer(), vec![1, 2, 9, 4, 5, 6]);
    }
}
