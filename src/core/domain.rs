use std::{fmt, path::Path, time::Duration};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
    C,
    Cpp,
    Java,
    Ruby,
    Php,
    Perl,
    Bash,
    Lua,
}

impl Language {
    pub const ALL: [Language; 10] = [
        Language::Python,
        Language::JavaScript,
        Language::C,
        Language::Cpp,
        Language::Java,
        Language::Ruby,
        Language::Php,
        Language::Perl,
        Language::Bash,
        Language::Lua,
    ];

    /// Identifier used on the wire.
    pub fn id(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Ruby => "ruby",
            Language::Php => "php",
            Language::Perl => "perl",
            Language::Bash => "bash",
            Language::Lua => "lua",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
            Language::C => "C",
            Language::Cpp => "C++",
            Language::Java => "Java",
            Language::Ruby => "Ruby",
            Language::Php => "PHP",
            Language::Perl => "Perl",
            Language::Bash => "Bash",
            Language::Lua => "Lua",
        }
    }

    /// Parses a wire identifier, a display name or a common short alias.
    /// Matching ignores case and surrounding whitespace.
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        let identifier = identifier.trim().to_ascii_lowercase();
        let language = match identifier.as_str() {
            "python" | "py" | "python3" => Language::Python,
            "javascript" | "js" | "node" => Language::JavaScript,
            "c" => Language::C,
            "cpp" | "c++" => Language::Cpp,
            "java" => Language::Java,
            "ruby" | "rb" => Language::Ruby,
            "php" => Language::Php,
            "perl" | "pl" => Language::Perl,
            "bash" | "sh" => Language::Bash,
            "lua" => Language::Lua,
            _ => return None,
        };
        Some(language)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_time_secs: Option<u64>,
    pub output_bytes: usize,
}

/// Program and argv of one phase. Arguments may reference `{source}`,
/// `{binary}` and `{dir}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: &'static str,
    pub args: &'static [&'static str],
}

/// Concrete paths substituted into a [`CommandTemplate`].
#[derive(Clone, Copy, Debug)]
pub struct CommandPaths<'a> {
    pub source: &'a Path,
    pub binary: &'a Path,
    pub dir: &'a Path,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub const fn new(program: &'static str, args: &'static [&'static str]) -> Self {
        Self { program, args }
    }

    pub fn expand(&self, paths: CommandPaths<'_>) -> CommandLine {
        CommandLine {
            program: substitute(self.program, paths),
            args: self.args.iter().map(|arg| substitute(arg, paths)).collect(),
        }
    }
}

fn substitute(template: &str, paths: CommandPaths<'_>) -> String {
    template
        .replace("{source}", &paths.source.to_string_lossy())
        .replace("{binary}", &paths.binary.to_string_lossy())
        .replace("{dir}", &paths.dir.to_string_lossy())
}

#[derive(Clone, Debug)]
pub struct LanguageStrategy {
    pub language: Language,
    pub source_file_name: &'static str,
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
    pub compile_timeout: Duration,
    pub run_timeout: Duration,
    pub compile_limits: ResourceLimits,
    pub limits: ResourceLimits,
}

impl LanguageStrategy {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub language: String,
    pub source_code: String,
    pub stdin: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Compile => f.write_str("compile"),
            Phase::Run => f.write_str("run"),
        }
    }
}

/// Raw result of one child process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub phase: Phase,
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if it did not exit normally.
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub truncated: bool,
    /// A descendant escaped the kill and held the output pipes open.
    pub orphaned: bool,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.memory_exceeded
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub compile: Option<ExecutionOutcome>,
    /// Absent when compilation was attempted and failed.
    pub run: Option<ExecutionOutcome>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output_string: String,
    pub error_string: String,
}
