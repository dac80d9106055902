use std::{collections::HashMap, time::Duration};

use itertools::Itertools;

use crate::{
    constants::MANAGED_RUNTIME_MEMORY_FACTOR,
    core::domain::{CommandTemplate, Language, LanguageStrategy, ResourceLimits},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unsupported language: {identifier} (supported: {supported})")]
    UnsupportedLanguage {
        identifier: String,
        supported: String,
    },
}

/// Limits every strategy starts from before language-specific adjustments.
#[derive(Clone, Debug)]
pub struct RegistryDefaults {
    pub compile_timeout: Duration,
    pub run_timeout: Duration,
    pub memory_bytes: Option<u64>,
    pub output_bytes: usize,
}

#[derive(Debug)]
pub struct LanguageRegistry {
    strategies: HashMap<Language, LanguageStrategy>,
}

impl LanguageRegistry {
    pub fn new(defaults: &RegistryDefaults) -> Self {
        let strategies = Language::ALL
            .into_iter()
            .map(|language| (language, builtin_strategy(language, defaults)))
            .collect();

        Self { strategies }
    }

    pub fn resolve(&self, identifier: &str) -> Result<&LanguageStrategy, RegistryError> {
        Language::from_identifier(identifier)
            .and_then(|language| self.strategies.get(&language))
            .ok_or_else(|| RegistryError::UnsupportedLanguage {
                identifier: identifier.to_string(),
                supported: self.languages().iter().map(Language::id).join(", "),
            })
    }

    /// Registered languages in declaration order.
    pub fn languages(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|language| self.strategies.contains_key(language))
            .collect()
    }

    pub fn strategies(&self) -> impl Iterator<Item = &LanguageStrategy> {
        self.languages()
            .into_iter()
            .filter_map(|language| self.strategies.get(&language))
    }

    /// Distinct programs the registered strategies invoke, excluding
    /// workspace-relative artifacts.
    pub fn toolchains(&self) -> Vec<&'static str> {
        self.strategies()
            .flat_map(|strategy| strategy.compile.iter().chain(std::iter::once(&strategy.run)))
            .map(|template| template.program)
            .filter(|program| !program.contains('{'))
            .unique()
            .collect()
    }
}

fn builtin_strategy(language: Language, defaults: &RegistryDefaults) -> LanguageStrategy {
    let (source_file_name, compile, run) = match language {
        Language::Python => (
            "main.py",
            None,
            CommandTemplate::new("python3", &["{source}"]),
        ),
        Language::JavaScript => ("main.js", None, CommandTemplate::new("node", &["{source}"])),
        Language::C => (
            "main.c",
            Some(CommandTemplate::new(
                "gcc",
                &["{source}", "-o", "{binary}", "-lm"],
            )),
            CommandTemplate::new("{binary}", &[]),
        ),
        Language::Cpp => (
            "main.cpp",
            Some(CommandTemplate::new(
                "g++",
                &["-std=c++17", "{source}", "-o", "{binary}"],
            )),
            CommandTemplate::new("{binary}", &[]),
        ),
        // javac derives the class name from the file name
        Language::Java => (
            "Main.java",
            Some(CommandTemplate::new("javac", &["-d", "{dir}", "{source}"])),
            CommandTemplate::new("java", &["-cp", "{dir}", "Main"]),
        ),
        Language::Ruby => ("main.rb", None, CommandTemplate::new("ruby", &["{source}"])),
        Language::Php => ("main.php", None, CommandTemplate::new("php", &["{source}"])),
        Language::Perl => ("main.pl", None, CommandTemplate::new("perl", &["{source}"])),
        Language::Bash => ("main.sh", None, CommandTemplate::new("bash", &["{source}"])),
        Language::Lua => ("main.lua", None, CommandTemplate::new("lua", &["{source}"])),
    };

    let memory_bytes = match language {
        Language::Java | Language::JavaScript => defaults
            .memory_bytes
            .map(|bytes| bytes.saturating_mul(MANAGED_RUNTIME_MEMORY_FACTOR)),
        _ => defaults.memory_bytes,
    };

    LanguageStrategy {
        language,
        source_file_name,
        compile,
        run,
        compile_timeout: defaults.compile_timeout,
        run_timeout: defaults.run_timeout,
        compile_limits: ResourceLimits {
            memory_bytes: None,
            cpu_time_secs: Some(cpu_budget(defaults.compile_timeout)),
            output_bytes: defaults.output_bytes,
        },
        limits: ResourceLimits {
            memory_bytes,
            cpu_time_secs: Some(cpu_budget(defaults.run_timeout)),
            output_bytes: defaults.output_bytes,
        },
    }
}

/// CPU seconds granted to a phase: the wall-clock budget rounded up, plus one.
fn cpu_budget(wall_clock: Duration) -> u64 {
    wall_clock.as_secs() + u64::from(wall_clock.subsec_nanos() > 0) + 1
}
