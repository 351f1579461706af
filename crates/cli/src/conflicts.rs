//! Conflict listing and detail views.

use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use tasksync_core::conflict::{format_payload, PayloadPreview};
use tasksync_core::models::ConflictRecord;

use crate::style;

/// Print the unresolved conflicts as a table.
pub fn print_list(conflicts: &[ConflictRecord]) {
    if conflicts.is_empty() {
        println!();
        println!("{}", style::success("No unresolved conflicts"));
        println!();
        return;
    }

    println!();
    println!(
        "{}",
        style::header(&format!("Unresolved Conflicts ({})", conflicts.len()))
    );
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Type", "Kind", "Local", "Remote", "Created"]);

    for c in conflicts {
        table.add_row(vec![
            Cell::new(&c.id),
            Cell::new(c.entity_type),
            Cell::new(c.kind()),
            Cell::new(side_title(&c.local_payload)),
            Cell::new(side_title(&c.remote_payload)),
            Cell::new(c.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!("{}", table);
    println!();
    println!(
        "{}",
        style::dim("Resolve with: tasksync resolve <ID> --accept local|remote")
    );
    println!();
}

/// Print one conflict with both payload previews.
pub fn print_detail(conflict: &ConflictRecord) {
    println!();
    println!("{}", style::header(&format!("Conflict {}", conflict.id)));
    println!("{}", "═".repeat(9 + conflict.id.len()));
    println!();
    println!("  Entity type : {}", conflict.entity_type);
    println!("  Kind        : {}", conflict.kind());
    println!("  Local id    : {}", conflict.local_id);
    println!("  Remote id   : {}", conflict.remote_id);
    println!("  Created at  : {}", conflict.created_at.to_rfc3339());
    if let (Some(resolution), Some(at)) = (conflict.resolution, conflict.resolved_at) {
        println!(
            "  Resolved    : {} at {}",
            style::side(resolution.as_str()),
            at.to_rfc3339()
        );
    }

    println!();
    print_side("Local", &conflict.local_payload);
    print_side("Remote", &conflict.remote_payload);
}

fn print_side(label: &str, payload: &str) {
    println!("  {}", style::header(label));
    println!("  {}", "─".repeat(40));
    if payload.is_empty() {
        println!("  {}", style::dim("(deleted)"));
    } else {
        let PayloadPreview { title, description } = format_payload(payload);
        println!("  Title       : {}", or_dash(&title));
        println!("  Description : {}", or_dash(&description));
    }
    println!();
}

fn side_title(payload: &str) -> String {
    if payload.is_empty() {
        return "(deleted)".to_string();
    }
    let title = format_payload(payload).title;
    crate::truncate(or_dash(&title), 30)
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}
