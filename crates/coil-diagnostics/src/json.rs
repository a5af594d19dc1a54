// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! JSON diagnostic output for tools.
//!
//! Each diagnostic carries 1-based locations and the source line it points
//! at, so consumers don't need the source file.

use serde::Serialize;

use coil_ast::LineMap;

use crate::{codes::ErrorCodeRegistry, Diagnostic, LabelStyle, Severity};

/// Diagnostics for one lowering run.
#[derive(Debug, Serialize)]
pub struct DiagnosticReport {
    pub version: u32,
    pub file: String,
    /// No errors. Warnings don't count.
    pub success: bool,
    pub phase: String,
    pub diagnostics: Vec<JsonDiagnostic>,
    pub error_count: usize,
    pub warning_count: usize,
}

#[derive(Debug, Serialize)]
pub struct JsonDiagnostic {
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    pub labels: Vec<JsonLabel>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub byte_offset: usize,
    pub source_line: String,
}

#[derive(Debug, Serialize)]
pub struct JsonLabel {
    pub role: LabelStyle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub start: LineCol,
    pub end: LineCol,
}

#[derive(Debug, Serialize)]
pub struct LineCol {
    pub line: usize,
    pub column: usize,
    pub byte_offset: usize,
}

pub fn to_json_report(
    diagnostics: &[Diagnostic],
    source: &str,
    file: &str,
    phase: &str,
) -> DiagnosticReport {
    let registry = ErrorCodeRegistry::default();
    let map = LineMap::new(source);

    let error_count = diagnostics.iter().filter(|d| d.severity == Severity::Error).count();
    let warning_count = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Warning)
        .count();

    DiagnosticReport {
        version: 1,
        file: file.to_string(),
        success: error_count == 0,
        phase: phase.to_string(),
        diagnostics: diagnostics
            .iter()
            .map(|d| to_json_diagnostic(d, source, &map, &registry))
            .collect(),
        error_count,
        warning_count,
    }
}

fn to_json_diagnostic(
    diag: &Diagnostic,
    source: &str,
    map: &LineMap,
    registry: &ErrorCodeRegistry,
) -> JsonDiagnostic {
    let line_col = |offset: usize| {
        let pos = map.position(offset.min(source.len()));
        LineCol {
            line: pos.line as usize,
            column: pos.col as usize,
            byte_offset: offset,
        }
    };

    let code = diag.code.as_ref().map(|c| c.0.clone());
    let category = code
        .as_deref()
        .and_then(|c| registry.get(c))
        .map(|info| info.category.to_string());

    let location = diag.primary_span().map(|span| {
        let at = line_col(span.start);
        SourceLocation {
            source_line: map.line(source, at.line as u32).unwrap_or("").to_string(),
            line: at.line,
            column: at.column,
            byte_offset: at.byte_offset,
        }
    });

    let labels = diag
        .labels
        .iter()
        .map(|l| JsonLabel {
            role: l.style,
            message: l.message.clone(),
            start: line_col(l.span.start),
            end: line_col(l.span.end),
        })
        .collect();

    JsonDiagnostic {
        severity: diag.severity,
        code,
        category,
        message: diag.message.clone(),
        location,
        labels,
        notes: diag.notes.clone(),
        help: diag.help.clone(),
    }
}

pub fn to_json_string(report: &DiagnosticReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToDiagnostic;
    use coil_ast::Span;
    use coil_mir::lower::{ForbiddenRegion, LowerError, LowerWarning, PointKind};

    const SRC: &str = "gen fn f() {\n    lock (m) { produce 1; }\n}\n";

    #[test]
    fn report_counts_and_locations() {
        let at = SRC.find("produce").unwrap_or(0);
        let diags = vec![
            LowerError::forbidden(PointKind::Produce, ForbiddenRegion::Lock, Span::new(at, at + 9))
                .to_diagnostic(),
            LowerWarning::AsyncWithoutWait {
                name: "g".into(),
                span: Span::new(0, 3),
            }
            .to_diagnostic(),
        ];
        let report = to_json_report(&diags, SRC, "f.coil", "lower");

        assert!(!report.success);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.warning_count, 1);

        let first = &report.diagnostics[0];
        assert_eq!(first.category.as_deref(), Some("Placement"));
        let loc = first.location.as_ref().map(|l| (l.line, l.column));
        assert_eq!(loc, Some((2, 16)));
        assert_eq!(first.labels[0].end.column, 25);
    }

    #[test]
    fn serializes_lowercase_enums() {
        let diag = Diagnostic::error("boom").with_primary(Span::new(0, 3), "here");
        let json = to_json_string(&to_json_report(&[diag], SRC, "f.coil", "lower"));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["success"], false);
        assert_eq!(value["diagnostics"][0]["severity"], "error");
        assert_eq!(value["diagnostics"][0]["labels"][0]["role"], "primary");
        assert_eq!(value["diagnostics"][0]["location"]["source_line"], "gen fn f() {");
        assert!(value["diagnostics"][0].get("code").is_none());
    }
}
