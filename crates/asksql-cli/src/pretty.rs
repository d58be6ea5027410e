//! Terminal output formatting for the asksql CLI.

use chrono::{DateTime, Utc};
use console::{Style, Term, style};

use asksql_core::ChatResponse;
use asksql_core::index::ScoredFragment;
use asksql_core::models::{ConversationSummary, ConversationWithTurns, Row, Turn, TurnRole};

const CELL_WIDTH: usize = 28;
const TABLE_ROWS: usize = 20;

/// Terminal width for formatting, with fallback.
fn term_width() -> usize {
    let (_, cols) = Term::stdout().size();
    usize::from(cols).max(40)
}

/// Format a relative time string (e.g., "2 days ago", "just now").
fn relative_time(dt: DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(dt);

    if duration.num_seconds() < 60 {
        return "just now".to_string();
    }
    if duration.num_minutes() < 60 {
        let mins = duration.num_minutes();
        return format!("{mins} min{s} ago", s = if mins == 1 { "" } else { "s" });
    }
    if duration.num_hours() < 24 {
        let hours = duration.num_hours();
        return format!("{hours} hour{s} ago", s = if hours == 1 { "" } else { "s" });
    }
    if duration.num_days() < 7 {
        let days = duration.num_days();
        return format!("{days} day{s} ago", s = if days == 1 { "" } else { "s" });
    }

    dt.format("%Y-%m-%d").to_string()
}

/// Ten-cell bar for a cosine similarity in `[-1, 1]`.
fn score_bar(score: f32) -> String {
    let clamped = score.clamp(0.0, 1.0);
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let filled = ((clamped * 10.0).round() as usize).min(10);
    "█".repeat(filled) + &"░".repeat(10 - filled)
}

fn role_style(role: TurnRole) -> Style {
    match role {
        TurnRole::User => Style::new().cyan().bold(),
        TurnRole::Assistant => Style::new().green().bold(),
    }
}

fn wrap(text: &str, indent: usize) -> String {
    let width = term_width().saturating_sub(indent + 2).max(40);
    textwrap::wrap(text.trim(), width)
        .into_iter()
        .map(|line| format!("{:indent$}{line}", ""))
        .collect::<Vec<_>>()
        .join("\n")
}

fn clip(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > max {
        let head: String = flat.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    } else {
        flat
    }
}

/// Render rows as an aligned text table.
pub fn render_rows(rows: &[Row]) -> String {
    let Some(first) = rows.first() else {
        return "(no rows)".to_string();
    };
    let columns: Vec<&str> = first.columns().collect();
    let shown = &rows[..rows.len().min(TABLE_ROWS)];

    let cells: Vec<Vec<String>> = shown
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|col| {
                    row.get(col)
                        .map(|v| clip(&v.to_string(), CELL_WIDTH))
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect();

    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            cells
                .iter()
                .map(|r| r[i].chars().count())
                .chain(std::iter::once(col.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: Vec<&str>| {
        values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{v:<w$}"))
            .collect::<Vec<_>>()
            .join(" │ ")
            .trim_end()
            .to_string()
    };

    let mut out = vec![line(columns.clone())];
    out.push(
        widths
            .iter()
            .map(|w| "─".repeat(*w))
            .collect::<Vec<_>>()
            .join("─┼─"),
    );
    for row in &cells {
        out.push(line(row.iter().map(String::as_str).collect()));
    }
    if rows.len() > shown.len() {
        out.push(format!("… {} more rows", rows.len() - shown.len()));
    }
    out.join("\n")
}

/// Print a chat response.
pub fn print_answer(question: &str, response: &ChatResponse) {
    if response.refined_question != question.trim() {
        println!(
            "{} {}",
            style("Understood as:").dim(),
            style(&response.refined_question).italic()
        );
    }
    if let Some(sql) = &response.sql {
        println!("{}", style("SQL").bold().yellow());
        println!("{}", wrap(sql, 2));
        println!();
    }
    if !response.table.is_empty() {
        println!("{}", render_rows(&response.table));
        println!();
    }
    println!("{}", wrap(&response.final_answer, 0));
    println!();
    println!(
        "{}",
        style(format!("conversation {}", response.conversation_id)).dim()
    );
}

/// Print retrieved context fragments with their similarity.
pub fn print_fragments(fragments: &[ScoredFragment]) {
    if fragments.is_empty() {
        println!("{}", style("No context retrieved.").dim());
        return;
    }
    for scored in fragments {
        let first_line = scored.fragment.text.lines().next().unwrap_or_default();
        println!(
            " {} {} {:<9} {}",
            style(score_bar(scored.score)).yellow(),
            style(format!("{:.2}", scored.score)).dim(),
            style(scored.fragment.kind.to_string()).cyan(),
            clip(first_line, term_width().saturating_sub(30))
        );
    }
}

/// Print conversation summaries, most recent first.
pub fn print_sessions(sessions: &[ConversationSummary]) {
    if sessions.is_empty() {
        println!("{}", style("No conversations found.").dim());
        return;
    }
    for session in sessions {
        println!(
            "{}  {}  {}",
            style(session.id).dim(),
            style(format!("{:>3} msgs", session.turn_count)).cyan(),
            style(clip(&session.title, 60)).bold()
        );
        println!(
            "    {}",
            style(format!(
                "started {}, last active {}",
                relative_time(session.created_at),
                relative_time(session.updated_at)
            ))
            .dim()
            .italic()
        );
    }
}

fn print_turn(turn: &Turn) {
    let label = turn.role.to_string();
    println!(
        "{} {}",
        role_style(turn.role).apply_to(label),
        style(turn.created_at.format("%Y-%m-%d %H:%M:%S")).dim()
    );
    if let Some(refined) = &turn.refined_question {
        println!("  {} {}", style("understood as:").dim(), style(refined).italic());
    }
    if let Some(query) = &turn.query {
        println!("{}", style(wrap(&query.sql, 2)).yellow());
        if !query.table.is_empty() {
            println!("{}", render_rows(&query.table));
        }
    }
    println!("{}", wrap(&turn.content, 2));
    println!();
}

/// Print a conversation with all of its turns.
pub fn print_conversation(conversation: &ConversationWithTurns) {
    let summary = &conversation.conversation;
    let width = term_width().min(100);
    println!("{}", style("═".repeat(width)).dim());
    println!(" {}", style(&summary.title).bold());
    println!(
        " {}",
        style(format!(
            "{} · {} messages · started {}",
            summary.id,
            summary.turn_count,
            relative_time(summary.created_at)
        ))
        .dim()
    );
    println!("{}", style("═".repeat(width)).dim());
    println!();
    for turn in &conversation.turns {
        print_turn(turn);
    }
}
