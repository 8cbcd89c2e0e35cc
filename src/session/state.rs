use std::fmt;

/// Lifecycle of a model handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Ready,
    Loaded,
    Executing,
    Disconnected,
    Terminated,
}

/// Control operations validated against the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Init,
    Input,
    Execute,
    Output,
    Abort,
    SaveCache,
    LoadCache,
    Terminate,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Loaded => "loaded",
            SessionState::Executing => "executing",
            SessionState::Disconnected => "disconnected",
            SessionState::Terminated => "terminated",
        }
    }

    /// Whether `operation` may start from this state.
    ///
    /// This is the coarse ordering check only; the session adds the
    /// conditions that depend on its contents (an unconsumed result, a cache
    /// load right after init).
    pub fn permits(self, operation: Operation) -> bool {
        use Operation::*;
        use SessionState::*;

        match operation {
            Init => matches!(self, Uninitialized | Disconnected),
            Input | SaveCache | LoadCache => self == Ready,
            Execute => self == Loaded,
            Output => matches!(self, Ready | Executing),
            Abort => self == Executing,
            Terminate => self != Terminated,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Init => "init",
            Operation::Input => "input",
            Operation::Execute => "execute",
            Operation::Output => "output",
            Operation::Abort => "abort",
            Operation::SaveCache => "save_kv_cache",
            Operation::LoadCache => "load_kv_cache",
            Operation::Terminate => "terminate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
