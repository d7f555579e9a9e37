use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources. Anything else under the
// package root (target, vendored reference material) is never scanned.
const SOURCE_DIRS: &[&str] = &["calibrate", "cli", "tests", "benches"];

// One source-hygiene rule: a line regex plus a filter that decides whether a
// matching line is a real violation.
#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ChangeLogComment,
    StarsInComment,
    ShoutingComment,
    AllowDeadCode,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscorePrefix,
        Rule::ChangeLogComment,
        Rule::StarsInComment,
        Rule::ShoutingComment,
        Rule::AllowDeadCode,
    ];

    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b",
            Rule::ChangeLogComment => {
                r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)"
            }
            Rule::StarsInComment => r"(//|/\*).*\*\*",
            Rule::ShoutingComment => r"(//|/\*).*",
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    // The build script itself quotes the forbidden patterns, so only the
    // underscore rule applies to it.
    fn applies_to_build_script(self) -> bool {
        matches!(self, Rule::UnderscorePrefix)
    }

    fn is_violation(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Rule::UnderscorePrefix => !trimmed.starts_with("//") && !inside_string_literal(line),
            Rule::ChangeLogComment | Rule::AllowDeadCode => true,
            // Bold markers are fine in rustdoc.
            Rule::StarsInComment => !is_doc_comment(trimmed),
            Rule::ShoutingComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed. Either use the binding (removing the underscore) or remove it."
            }
            Rule::ChangeLogComment => {
                "Comments describe the code as it is, not how it changed. Remove change-log wording."
            }
            Rule::StarsInComment => "Use plain text in ordinary comments; ** belongs in doc comments only.",
            Rule::ShoutingComment => "Comments must not be written entirely in capitals.",
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] is forbidden. Either use the code or delete it."
            }
        }
    }
}

fn is_doc_comment(trimmed: &str) -> bool {
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// Text of the comment on this line, if the line carries one.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed
        .strip_prefix("///")
        .or_else(|| trimmed.strip_prefix("//!"))
        .or_else(|| trimmed.strip_prefix("//"))
    {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let body = &line[start..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

// True when an underscore-prefixed token on this line sits between quotes.
fn inside_string_literal(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

struct LineCollector {
    rule: Rule,
    violations: Vec<String>,
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_file(rule: Rule, matcher: &RegexMatcher, path: &Path) -> Result<(), Box<dyn Error>> {
    let mut collector = LineCollector {
        rule,
        violations: Vec::new(),
    };
    Searcher::new().search_path(matcher, path, &mut collector)?;
    if collector.violations.is_empty() {
        return Ok(());
    }

    let mut message = format!(
        "\n❌ ERROR: {} source-hygiene violation(s) in {}:\n",
        collector.violations.len(),
        path.display()
    );
    for violation in &collector.violations {
        message.push_str(&format!("   {violation}\n"));
    }
    message.push_str(&format!("\n⚠️ {}\n", rule.explanation()));
    Err(message.into())
}

fn scan_sources() -> Result<(), Box<dyn Error>> {
    let sources = rust_sources();
    let build_script = Path::new("build.rs");
    for rule in Rule::ALL {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
        for path in &sources {
            check_file(rule, &matcher, path)?;
        }
        if rule.applies_to_build_script() {
            check_file(rule, &matcher, build_script)?;
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = scan_sources() {
        // Printed to stderr so cargo shows it when the build fails.
        eprintln!("{e}");
        std::process::exit(1);
    }
}
