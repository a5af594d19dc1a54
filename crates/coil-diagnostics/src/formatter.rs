// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Terminal formatter for diagnostics.
//!
//! ```text
//! error[C0101]: cannot wait inside a lock body
//!   --> fetch.coil:3:9
//!    |
//!  3 |         wait load(key);
//!    |         ^^^^^^^^^^^^^^ wait here
//!    |
//!    = note: a lock must be released by the thread that took it
//!    = help: release the lock before suspending
//! ```

use std::collections::BTreeMap;

use colored::Colorize;

use coil_ast::LineMap;

use crate::{Diagnostic, LabelStyle, Severity};

pub struct DiagnosticFormatter<'a> {
    source: &'a str,
    file_name: Option<&'a str>,
    line_map: LineMap,
}

struct AnnotatedLine {
    line_num: usize,
    text: String,
    annotations: Vec<Annotation>,
}

struct Annotation {
    col_start: usize,
    col_end: usize,
    style: LabelStyle,
    message: Option<String>,
}

impl<'a> DiagnosticFormatter<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            file_name: None,
            line_map: LineMap::new(source),
        }
    }

    pub fn with_file_name(mut self, name: &'a str) -> Self {
        self.file_name = Some(name);
        self
    }

    pub fn format(&self, diagnostic: &Diagnostic) -> String {
        let mut out = String::new();
        self.format_header(&mut out, diagnostic);

        let annotated = self.collect_annotated_lines(diagnostic);
        let Some(anchor) = diagnostic.primary_span() else {
            self.format_footer(&mut out, diagnostic);
            return out;
        };

        let (line, col) = self.line_col(anchor.start);
        out.push_str(&format!(
            "  {} {}:{}:{}\n",
            "-->".blue(),
            self.file_name.unwrap_or("<source>"),
            line,
            col
        ));

        let max_line = annotated.last().map(|a| a.line_num).unwrap_or(1);
        let gutter = max_line.to_string().len().max(2);

        let mut prev: Option<usize> = None;
        for annotated_line in &annotated {
            match prev {
                None => out.push_str(&format!("{} {}\n", " ".repeat(gutter + 1), "|".blue())),
                Some(p) if annotated_line.line_num > p + 1 => {
                    out.push_str(&format!("{} {}\n", " ".repeat(gutter), "...".blue()))
                }
                Some(_) => {}
            }
            out.push_str(&format!(
                "{:>width$} {} {}\n",
                annotated_line.line_num.to_string().blue().bold(),
                "|".blue(),
                annotated_line.text,
                width = gutter + 1,
            ));
            self.format_annotations(&mut out, annotated_line, gutter);
            prev = Some(annotated_line.line_num);
        }

        if !diagnostic.notes.is_empty() || diagnostic.help.is_some() {
            out.push_str(&format!("{} {}\n", " ".repeat(gutter + 1), "|".blue()));
        }
        self.format_footer(&mut out, diagnostic);
        out
    }

    /// Render several diagnostics separated by blank lines.
    pub fn format_all(&self, diagnostics: &[Diagnostic]) -> String {
        diagnostics
            .iter()
            .map(|d| self.format(d))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn format_header(&self, out: &mut String, diagnostic: &Diagnostic) {
        let severity = match diagnostic.severity {
            Severity::Error => "error".red().bold(),
            Severity::Warning => "warning".yellow().bold(),
            Severity::Note => "note".blue().bold(),
        };
        match &diagnostic.code {
            Some(code) => out.push_str(&format!(
                "{}[{}]: {}\n",
                severity,
                code.0.as_str().bold(),
                diagnostic.message.bold()
            )),
            None => out.push_str(&format!("{}: {}\n", severity, diagnostic.message.bold())),
        }
    }

    fn format_footer(&self, out: &mut String, diagnostic: &Diagnostic) {
        for note in &diagnostic.notes {
            out.push_str(&format!("   {} {}: {}\n", "=".cyan(), "note".cyan().bold(), note));
        }
        if let Some(help) = &diagnostic.help {
            out.push_str(&format!("   {} {}: {}\n", "=".cyan(), "help".cyan().bold(), help));
        }
    }

    fn collect_annotated_lines(&self, diagnostic: &Diagnostic) -> Vec<AnnotatedLine> {
        let mut lines: BTreeMap<usize, AnnotatedLine> = BTreeMap::new();

        for label in &diagnostic.labels {
            let (line_num, col_start) = self.line_col(label.span.start);
            let (end_line, col_end) = self.line_col(label.span.end);
            let text = self.line_text(line_num);

            // Multi-line spans underline the rest of the first line.
            let col_end = if end_line == line_num {
                col_end
            } else {
                text.len() + 1
            };

            let entry = lines.entry(line_num).or_insert_with(|| AnnotatedLine {
                line_num,
                text: text.to_string(),
                annotations: Vec::new(),
            });
            entry.annotations.push(Annotation {
                col_start,
                col_end: col_end.max(col_start + 1),
                style: label.style,
                message: label.message.clone(),
            });
        }

        lines.into_values().collect()
    }

    fn format_annotations(&self, out: &mut String, line: &AnnotatedLine, gutter: usize) {
        let mut sorted: Vec<&Annotation> = line.annotations.iter().collect();
        sorted.sort_by_key(|a| (a.style == LabelStyle::Secondary, a.col_start));

        let width = sorted.iter().map(|a| a.col_end).max().unwrap_or(0);
        let mut underline = vec![' '; width];
        let mut messages: Vec<(usize, LabelStyle, &str)> = Vec::new();

        // Secondary first so primary carets win on overlap.
        for ann in sorted.iter().rev() {
            let ch = match ann.style {
                LabelStyle::Primary => '^',
                LabelStyle::Secondary => '-',
            };
            for slot in underline
                .iter_mut()
                .take(ann.col_end - 1)
                .skip(ann.col_start - 1)
            {
                *slot = ch;
            }
        }
        for ann in &sorted {
            if let Some(msg) = &ann.message {
                messages.push((ann.col_start, ann.style, msg));
            }
        }

        let underline: String = underline.into_iter().collect::<String>().trim_end().to_string();
        let pad = " ".repeat(gutter + 1);
        let styled = |style: LabelStyle, text: &str| match style {
            LabelStyle::Primary => text.red().bold().to_string(),
            LabelStyle::Secondary => text.blue().to_string(),
        };

        match messages.as_slice() {
            [] => out.push_str(&format!("{} {} {}\n", pad, "|".blue(), color_underline(&underline))),
            [(_, style, msg)] => out.push_str(&format!(
                "{} {} {} {}\n",
                pad,
                "|".blue(),
                color_underline(&underline),
                styled(*style, msg)
            )),
            many => {
                out.push_str(&format!("{} {} {}\n", pad, "|".blue(), color_underline(&underline)));
                for (col, style, msg) in many.iter().rev() {
                    out.push_str(&format!(
                        "{} {} {}{} {}\n",
                        pad,
                        "|".blue(),
                        " ".repeat(col.saturating_sub(1)),
                        styled(*style, "|"),
                        styled(*style, msg)
                    ));
                }
            }
        }
    }

    /// 1-based line and column of a byte offset.
    fn line_col(&self, offset: usize) -> (usize, usize) {
        let pos = self.line_map.position(offset.min(self.source.len()));
        (pos.line as usize, pos.col as usize)
    }

    fn line_text(&self, line: usize) -> &'a str {
        self.line_map.line(self.source, line as u32).unwrap_or("")
    }
}

/// Color runs of `^` red and runs of `-` blue.
fn color_underline(s: &str) -> String {
    let mut out = String::new();
    let mut run = String::new();
    let mut run_char = ' ';
    for ch in s.chars() {
        if ch != run_char && !run.is_empty() {
            flush_run(&mut out, &run, run_char);
            run.clear();
        }
        run_char = ch;
        run.push(ch);
    }
    if !run.is_empty() {
        flush_run(&mut out, &run, run_char);
    }
    out
}

fn flush_run(out: &mut String, run: &str, ch: char) {
    match ch {
        '^' => out.push_str(&run.red().bold().to_string()),
        '-' => out.push_str(&run.blue().to_string()),
        _ => out.push_str(run),
    }
}
