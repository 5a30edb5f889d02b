use std::cell::RefCell;

use rustc_hash::FxHashSet;

/// Read a boolean feature flag from an environment variable.
fn env_flag(name: &str, default: bool) -> bool {
    let Ok(value) = std::env::var(name) else {
        return default;
    };
    match value.as_str() {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        other => {
            eprintln!("Unrecognized boolean value \"{}\" for {}", other, name);
            default
        }
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    /// Don't show any diagnostics.
    Off,
    /// Report only operators that could not be vectorized.
    Warn,
    /// Report all rewrites.
    Info,
}

/// Diagnostic reporter for vectorization rewrites.
pub struct Diagnostics {
    /// Operators against which diagnostics have been reported at the
    /// `Warn` level or higher.
    warned_ops: RefCell<FxHashSet<&'static str>>,
    level: DiagnosticLevel,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            warned_ops: RefCell::new(FxHashSet::default()),
            level: DiagnosticLevel::Off,
        }
    }

    /// Create a reporter whose level is taken from the `PACKWISE_WARN`
    /// and `PACKWISE_VERBOSE` environment variables.
    pub fn from_env() -> Self {
        let mut diagnostics = Self::new();
        if env_flag("PACKWISE_VERBOSE", false) {
            diagnostics.set_level(DiagnosticLevel::Info);
        } else if env_flag("PACKWISE_WARN", false) {
            diagnostics.set_level(DiagnosticLevel::Warn);
        }
        diagnostics
    }

    /// Enable reporting of all messages at or above a given level.
    pub fn set_level(&mut self, level: DiagnosticLevel) {
        self.level = level;
    }

    /// Return true if diagnostic messages are enabled at a given level.
    pub fn enabled(&self, level: DiagnosticLevel) -> bool {
        self.level >= level
    }

    /// Log a diagnostic message for a given operator at the
    /// [`Info`](DiagnosticLevel::Info) level.
    pub fn info(&self, op_name: &'static str, message: std::fmt::Arguments<'_>) {
        if self.level < DiagnosticLevel::Info {
            return;
        }
        self.log(DiagnosticLevel::Info, op_name, message);
    }

    /// Log a diagnostic message for a given operator at the
    /// [`Warn`](DiagnosticLevel::Warn) level. Repeated warnings for the
    /// same operator are reported once.
    pub fn warn(&self, op_name: &'static str, message: std::fmt::Arguments<'_>) {
        if self.level < DiagnosticLevel::Warn || self.warned_ops.borrow().contains(op_name) {
            return;
        }
        self.warned_ops.borrow_mut().insert(op_name);
        self.log(DiagnosticLevel::Warn, op_name, message);
    }

    fn log(&self, level: DiagnosticLevel, op_name: &'static str, message: std::fmt::Arguments<'_>) {
        let level_char = match level {
            DiagnosticLevel::Warn => 'W',
            DiagnosticLevel::Info => 'I',
            DiagnosticLevel::Off => unreachable!(),
        };
        println!("{}| {}: {}", level_char, op_name, message);
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
