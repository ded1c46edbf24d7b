//! Diagnostic sink: the host-implemented channel that receives structured
//! messages (errors, warnings, and debug dumps of AST/IR/assembly) during a
//! compile call.

use super::Position;

/// Diagnostic categories. `Error` and `Warning` always flow to the sink
/// regardless of [`crate::program::CompileOptions`]; the `*Initial`/`*Final`
/// and `MachineCode` dumps are gated by the corresponding debug bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Error,
    Warning,
    AstInitial,
    AstFinal,
    IrInitial,
    IrFinal,
    MachineCode,
}

/// A single diagnostic message.
#[derive(Clone, Debug)]
pub struct Message {
    pub category: Category,
    pub header: String,
    pub body: String,
    pub pos: Option<Position>,
}

impl Message {
    pub fn new(category: Category, header: impl Into<String>, body: impl Into<String>) -> Message {
        Message { category, header: header.into(), body: body.into(), pos: None }
    }

    pub fn at(mut self, pos: Position) -> Message {
        self.pos = Some(pos);
        self
    }
}

/// The host-implemented sink. A narrow, single-method capability: it must
/// not mutate compiler state, only observe messages as they are produced,
/// synchronously within the compiling thread.
pub trait OutputLog {
    fn log(&self, message: &Message);
}

/// An `OutputLog` that writes every message through the `log` crate at a
/// level matching its category, for hosts that just want their existing
/// logging setup (`env_logger`, etc.) to pick these up.
pub struct TracingLog;

impl OutputLog for TracingLog {
    fn log(&self, message: &Message) {
        match message.category {
            Category::Error => log::error!("{}: {}", message.header, message.body),
            Category::Warning => log::warn!("{}: {}", message.header, message.body),
            _ => log::debug!("{}:\n{}", message.header, message.body),
        }
    }
}

/// A sink that collects every message in order, useful for tests and for
/// hosts that want to inspect diagnostics after the fact rather than stream
/// them.
#[derive(Default)]
pub struct CollectingLog {
    messages: std::cell::RefCell<Vec<Message>>,
}

impl CollectingLog {
    pub fn new() -> CollectingLog {
        CollectingLog::default()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages.into_inner()
    }

    pub fn messages(&self) -> std::cell::Ref<'_, Vec<Message>> {
        self.messages.borrow()
    }
}

impl OutputLog for CollectingLog {
    fn log(&self, message: &Message) {
        self.messages.borrow_mut().push(message.clone());
    }
}
