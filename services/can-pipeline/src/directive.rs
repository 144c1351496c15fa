//! Typed commands the control plane issues to the Logger, replacing the
//! source's socket-callback dispatch with a plain enum delivered over an
//! in-process channel.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Start,
    Stop,
    AutoOn,
    AutoOff,
    TimeReset,
}

impl Directive {
    /// Parse one of the five recognized literals. Anything else is rejected
    /// rather than guessed at.
    pub fn parse(s: &str) -> Option<Directive> {
        match s {
            "start" => Some(Directive::Start),
            "stop" => Some(Directive::Stop),
            "auto_on" => Some(Directive::AutoOn),
            "auto_off" => Some(Directive::AutoOff),
            "time_reset" => Some(Directive::TimeReset),
            _ => None,
        }
    }
}
