/// Values shown by `quarry status`.
pub struct StatusSummary {
    pub database: String,
    pub migrations_dir: String,
    pub current: String,
    pub latest: String,
    pub available: usize,
    pub pending: usize,
    pub failed: usize,
    pub drifted: Vec<String>,
}

pub fn print_status(summary: &StatusSummary) {
    for line in render_status(summary) {
        println!("{line}");
    }
}

/// Lay the summary out as a boxed table.
pub fn render_status(summary: &StatusSummary) -> Vec<String> {
    let version = env!("CARGO_PKG_VERSION");
    let label_w = 12;

    let drifted = if summary.drifted.is_empty() {
        "none".to_string()
    } else {
        summary.drifted.join(", ")
    };
    let rows = [
        ("Database", summary.database.clone()),
        ("Scripts", summary.migrations_dir.clone()),
        ("Current", summary.current.clone()),
        ("Latest", summary.latest.clone()),
        ("Available", summary.available.to_string()),
        ("Pending", summary.pending.to_string()),
        ("Failed", summary.failed.to_string()),
        ("Drifted", drifted),
    ];

    let title = format!("Quarry v{version}");
    let value_w = rows
        .iter()
        .map(|(_, value)| value.chars().count())
        .max()
        .unwrap_or(0)
        .max(title.chars().count());
    let inner_w = label_w + value_w;

    // 7 = "╭─── " + " " + "╮"
    let title_dashes = inner_w + 4 - 7 - title.chars().count();
    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format!("╭─── {title} {}╮", "─".repeat(title_dashes)));
    for (label, value) in &rows {
        lines.push(format!("│ {label:<label_w$}{value:<value_w$} │"));
    }
    lines.push(format!("╰{}╯", "─".repeat(inner_w + 2)));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> StatusSummary {
        StatusSummary {
            database: "app.db".into(),
            migrations_dir: "migrations".into(),
            current: "2".into(),
            latest: "3".into(),
            available: 3,
            pending: 1,
            failed: 0,
            drifted: vec![],
        }
    }

    #[test]
    fn rows_share_one_width() {
        let lines = render_status(&summary());
        let widths: Vec<usize> = lines.iter().map(|l| l.chars().count()).collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]), "{lines:#?}");
        assert!(lines[0].starts_with("╭─── Quarry v"));
        assert!(lines.iter().any(|l| l.contains("Pending") && l.contains('1')));
    }

    #[test]
    fn drifted_versions_are_listed() {
        let mut s = summary();
        s.drifted = vec!["1".into(), "2.5".into()];
        let lines = render_status(&s);
        assert!(lines.iter().any(|l| l.contains("Drifted") && l.contains("1, 2.5")));
    }
}
