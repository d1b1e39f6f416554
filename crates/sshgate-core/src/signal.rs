//! Signal names deliverable through an SSH `signal` channel request.

use crate::error::GateError;
use std::fmt;
use std::str::FromStr;

/// Signals defined by RFC 4254 section 6.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Abrt,
    Alrm,
    Fpe,
    Hup,
    Ill,
    Int,
    Kill,
    Pipe,
    Quit,
    Segv,
    Term,
    Usr1,
    Usr2,
}

impl Signal {
    pub const ALL: [Signal; 13] = [
        Signal::Abrt,
        Signal::Alrm,
        Signal::Fpe,
        Signal::Hup,
        Signal::Ill,
        Signal::Int,
        Signal::Kill,
        Signal::Pipe,
        Signal::Quit,
        Signal::Segv,
        Signal::Term,
        Signal::Usr1,
        Signal::Usr2,
    ];

    /// Name without the `SIG` prefix, as sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Abrt => "ABRT",
            Signal::Alrm => "ALRM",
            Signal::Fpe => "FPE",
            Signal::Hup => "HUP",
            Signal::Ill => "ILL",
            Signal::Int => "INT",
            Signal::Kill => "KILL",
            Signal::Pipe => "PIPE",
            Signal::Quit => "QUIT",
            Signal::Segv => "SEGV",
            Signal::Term => "TERM",
            Signal::Usr1 => "USR1",
            Signal::Usr2 => "USR2",
        }
    }

    /// Linux signal number. Backends targeting a real process should use
    /// the platform constants instead.
    pub fn number(&self) -> i32 {
        match self {
            Signal::Hup => 1,
            Signal::Int => 2,
            Signal::Quit => 3,
            Signal::Ill => 4,
            Signal::Abrt => 6,
            Signal::Fpe => 8,
            Signal::Kill => 9,
            Signal::Usr1 => 10,
            Signal::Segv => 11,
            Signal::Usr2 => 12,
            Signal::Pipe => 13,
            Signal::Alrm => 14,
            Signal::Term => 15,
        }
    }

    /// Whether the default disposition of this signal ends the process.
    pub fn terminates(&self) -> bool {
        !matches!(self, Signal::Usr1 | Signal::Usr2)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = GateError;

    /// Accepts `TERM` as well as `SIGTERM`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let name = input.strip_prefix("SIG").unwrap_or(input);
        Signal::ALL
            .iter()
            .copied()
            .find(|s| s.name() == name)
            .ok_or_else(|| GateError::BackendFailure(format!("unsupported signal: {input}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_prefix() {
        assert_eq!("TERM".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("SIGUSR1".parse::<Signal>().unwrap(), Signal::Usr1);
        assert_eq!(Signal::Kill.to_string(), "KILL");
    }

    #[test]
    fn rejects_unknown() {
        assert!(matches!(
            "WINCH".parse::<Signal>(),
            Err(GateError::BackendFailure(_))
        ));
        assert!("term".parse::<Signal>().is_err());
    }

    #[test]
    fn names_round_trip() {
        for signal in Signal::ALL {
            assert_eq!(signal.name().parse::<Signal>().unwrap(), signal);
        }
    }
}
