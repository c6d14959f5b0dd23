//! Message layout, opcodes, and payload decoders.
//!
//! Every framed message is `length | a | b | c | payload`, each header field a
//! `u32` in the negotiated byte order, with `length` counting the header
//! itself.

use crate::codec::{ByteOrder, WireReader, WireWriter};
use crate::types::{
    AgentError, BreakpointEvent, BreakpointId, Frame, FrameLanguage, FrameLevel, LocalValue,
    LocalVariable, Result, ThreadEvent, ThreadEventKind, ThreadFlags, ThreadId, ThreadInfo,
    ThreadState,
};

pub const CLIENT_HANDSHAKE: &[u8; 16] = b"TETHER-CLIENT-01";
pub const AGENT_HANDSHAKE: &[u8; 16] = b"TETHER-AGENT--01";
/// Agent identifier + endianness flag + version.
pub const AGENT_HANDSHAKE_LEN: usize = AGENT_HANDSHAKE.len() + 1 + 4;

pub const HEADER_LEN: usize = 16;
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Continuation value that terminates a multi-reply sequence.
pub const END_OF_REPLIES: u32 = u32::MAX;

pub const REPLY_KIND_ERROR: u32 = 0;
pub const REPLY_KIND_EVENT: u32 = 1;
pub const REPLY_KIND_REPLY: u32 = 2;

pub const EVENT_BREAKPOINT_HIT: u32 = 0;
pub const EVENT_THREAD_STARTED: u32 = 1;
pub const EVENT_THREAD_ENDED: u32 = 2;
pub const EVENT_STEP_COMPLETED: u32 = 3;

pub const LOCAL_FLAG_ARGUMENT: u32 = 1;
pub const LOCAL_FLAG_INVALID: u32 = 2;
pub const LOCAL_FLAG_ANONYMOUS: u32 = 4;
pub const LOCAL_FLAG_SLOT: u32 = 8;

pub const VALUE_TAG_INT: u32 = 0;
pub const VALUE_TAG_BOOL: u32 = 1;
pub const VALUE_TAG_DOUBLE: u32 = 2;
pub const VALUE_TAG_STRING: u32 = 3;
pub const VALUE_TAG_FLOAT: u32 = 4;

/// Step modifier asking the agent to keep stepping until control is back in
/// a frame of the tracked language.
pub const STEP_UNTIL_TRACKED: u32 = 1 << 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    ListThreads = 1,
    ThreadInfo = 2,
    SuspendThread = 3,
    ResumeThread = 4,
    ThreadStack = 5,
    FrameLocals = 6,
    SetBreakpoint = 7,
    EnableBreakpoint = 8,
    DisableBreakpoint = 9,
    DeleteBreakpoint = 10,
    Evaluate = 11,
    SourceFile = 12,
    Step = 13,
}

impl Opcode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::ListThreads,
            2 => Self::ThreadInfo,
            3 => Self::SuspendThread,
            4 => Self::ResumeThread,
            5 => Self::ThreadStack,
            6 => Self::FrameLocals,
            7 => Self::SetBreakpoint,
            8 => Self::EnableBreakpoint,
            9 => Self::DisableBreakpoint,
            10 => Self::DeleteBreakpoint,
            11 => Self::Evaluate,
            12 => Self::SourceFile,
            13 => Self::Step,
            _ => return None,
        })
    }

    /// State the engine waits in after dispatching this opcode.
    pub fn reply_shape(self) -> ReplyShape {
        match self {
            Self::ThreadStack | Self::FrameLocals => ReplyShape::Multi,
            _ => ReplyShape::Single,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    Single,
    Multi,
}

/// Human-readable message for an agent error code.
pub fn error_message(code: u32) -> String {
    let known = match code {
        1 => "invalid thread id",
        2 => "thread not suspended",
        3 => "invalid stack frame",
        4 => "unknown method",
        5 => "invalid breakpoint id",
        6 => "expression evaluation failed",
        7 => "thread not alive",
        8 => "source not available",
        9 => "invalid line number",
        10 => "unsupported command",
        _ => return format!("agent error code {code}"),
    };
    known.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    U32(u32),
    Str(String),
}

/// An outgoing request before it is framed.
///
/// Encoding is deferred until dispatch because the byte order is only known
/// once the handshake has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub b: u32,
    pub c: u32,
    pub payload: Vec<Field>,
}

impl Request {
    pub fn new(opcode: Opcode, b: u32, c: u32) -> Self {
        Self {
            opcode,
            b,
            c,
            payload: Vec::new(),
        }
    }

    pub fn with(mut self, field: Field) -> Self {
        self.payload.push(field);
        self
    }

    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(order, HEADER_LEN);
        w.write_u32(0);
        w.write_u32(self.opcode.code());
        w.write_u32(self.b);
        w.write_u32(self.c);
        for field in &self.payload {
            match field {
                Field::U32(v) => w.write_u32(*v),
                Field::Str(s) => w.write_string(s),
            }
        }
        let len = w.len() as u32;
        w.patch_u32(0, len);
        w.into_vec()
    }
}

/// One de-framed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub order: ByteOrder,
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub payload: Vec<u8>,
}

impl Message {
    /// Parse a complete frame (header included).
    pub fn parse(frame: &[u8], order: ByteOrder) -> Result<Self> {
        let mut r = WireReader::new(frame, order);
        let len = r.read_u32()? as usize;
        if len != frame.len() {
            return Err(AgentError::Protocol(format!(
                "frame length {len} does not match {} buffered bytes",
                frame.len()
            )));
        }
        let a = r.read_u32()?;
        let b = r.read_u32()?;
        let c = r.read_u32()?;
        let payload = r.read_bytes(len - HEADER_LEN)?.to_vec();
        Ok(Self {
            order,
            a,
            b,
            c,
            payload,
        })
    }

    pub fn reader(&self) -> WireReader<'_> {
        WireReader::new(&self.payload, self.order)
    }

    pub fn is_end_of_replies(&self) -> bool {
        self.c == END_OF_REPLIES
    }

    /// Frame this message back into bytes (used by the mock agent).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(self.order, HEADER_LEN + self.payload.len());
        w.write_u32((HEADER_LEN + self.payload.len()) as u32);
        w.write_u32(self.a);
        w.write_u32(self.b);
        w.write_u32(self.c);
        w.write_bytes(&self.payload);
        w.into_vec()
    }
}

/// Classified response.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Error { code: u32 },
    Event(AgentEvent),
    Reply(Message),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Breakpoint(BreakpointEvent),
    Thread(ThreadEvent),
    StepCompleted { thread_id: ThreadId },
    /// Event kinds this client does not know about.
    Unknown { kind: u32, thread_id: ThreadId },
}

pub fn classify(message: Message) -> Result<Inbound> {
    match message.a {
        REPLY_KIND_ERROR => Ok(Inbound::Error { code: message.b }),
        REPLY_KIND_EVENT => decode_event(&message).map(Inbound::Event),
        REPLY_KIND_REPLY => Ok(Inbound::Reply(message)),
        other => Err(AgentError::Protocol(format!("unknown reply kind {other}"))),
    }
}

fn decode_event(message: &Message) -> Result<AgentEvent> {
    let thread_id = message.c;
    Ok(match message.b {
        EVENT_BREAKPOINT_HIT => {
            let breakpoint_id: BreakpointId = message.reader().read_u32()?;
            AgentEvent::Breakpoint(BreakpointEvent {
                breakpoint_id,
                thread_id,
            })
        }
        EVENT_THREAD_STARTED => AgentEvent::Thread(ThreadEvent {
            kind: ThreadEventKind::Started,
            thread_id,
        }),
        EVENT_THREAD_ENDED => AgentEvent::Thread(ThreadEvent {
            kind: ThreadEventKind::Ended,
            thread_id,
        }),
        EVENT_STEP_COMPLETED => AgentEvent::StepCompleted { thread_id },
        kind => AgentEvent::Unknown { kind, thread_id },
    })
}

pub fn decode_thread_ids(reply: &Message) -> Result<Vec<ThreadId>> {
    let mut r = reply.reader();
    let count = r.read_u32()? as usize;
    // Each id is four bytes; reject counts the payload cannot hold before allocating.
    if count > r.remaining() / 4 {
        return Err(AgentError::Protocol(format!(
            "thread count {count} exceeds payload"
        )));
    }
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(r.read_u32()?);
    }
    Ok(ids)
}

pub fn decode_thread_info(reply: &Message) -> Result<ThreadInfo> {
    let mut r = reply.reader();
    let priority = r.read_u32()?;
    let is_daemon = r.read_u32()? != 0;
    let state = ThreadState::from_code(r.read_u32()?);
    let flags = ThreadFlags::from_bits(r.read_u32()?);
    let name = r.read_string()?;
    Ok(ThreadInfo {
        priority,
        is_daemon,
        state,
        name,
        flags,
    })
}

pub fn decode_frame(reply: &Message) -> Result<Frame> {
    let mut r = reply.reader();
    let offset = r.read_u32()?;
    let language = FrameLanguage::from_tag(r.read_u32()?);
    let name = r.read_string()?;
    Ok(Frame {
        level: reply.b as FrameLevel,
        offset,
        name,
        language,
    })
}

pub fn decode_local(reply: &Message) -> Result<LocalVariable> {
    let mut r = reply.reader();
    let name = r.read_string()?;
    let flags = r.read_u32()?;
    let tag = r.read_u32()?;
    let value = match tag {
        VALUE_TAG_INT => LocalValue::Int(r.read_i32()?),
        VALUE_TAG_BOOL => LocalValue::Bool(r.read_u32()? != 0),
        VALUE_TAG_DOUBLE => LocalValue::Double(r.read_f64()?),
        VALUE_TAG_FLOAT => LocalValue::Float(r.read_f32()?),
        VALUE_TAG_STRING => LocalValue::Str(r.read_string()?),
        tag => LocalValue::Unknown { tag },
    };
    Ok(LocalVariable {
        name,
        is_argument: flags & LOCAL_FLAG_ARGUMENT != 0,
        is_invalid: flags & LOCAL_FLAG_INVALID != 0,
        is_anonymous: flags & LOCAL_FLAG_ANONYMOUS != 0,
        is_slot: flags & LOCAL_FLAG_SLOT != 0,
        value,
    })
}

pub fn decode_string(reply: &Message) -> Result<String> {
    reply.reader().read_string()
}
