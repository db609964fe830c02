//! Read-only audit exports: CSV and a plain-text report.

use std::fmt::Write as _;

use crate::audit::types::{AuditEntry, AuditStatistics};

const CSV_HEADER: &str =
    "timestamp,escrow_id,action,actor,custody_address,amount,tx_hash,ip_address,user_agent";

/// Quote a CSV field when it contains a delimiter, quote or newline.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render entries as CSV, one row per entry, in the order given.
pub fn to_csv(entries: &[AuditEntry]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + entries.len() * 128);
    out.push_str(CSV_HEADER);
    out.push('\n');

    for entry in entries {
        let fields = [
            entry.timestamp.to_rfc3339(),
            entry.escrow_id.to_string(),
            entry.action.name().to_string(),
            entry.actor.clone(),
            entry
                .custody_address
                .map(|a| a.to_string())
                .unwrap_or_default(),
            entry.amount.map(|a| a.to_string()).unwrap_or_default(),
            entry.tx_hash.clone().unwrap_or_default(),
            entry.ip_address.clone().unwrap_or_default(),
            entry.user_agent.clone().unwrap_or_default(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }

    out
}

/// Human-readable report: summary statistics followed by the entries.
pub fn to_text_report(stats: &AuditStatistics, entries: &[AuditEntry]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "CUSTODY AUDIT REPORT");
    let _ = writeln!(out, "====================");
    if let (Some(first), Some(last)) = (stats.first_entry, stats.last_entry) {
        let _ = writeln!(out, "Period:            {} .. {}", first.to_rfc3339(), last.to_rfc3339());
    }
    let _ = writeln!(out, "Total entries:     {}", stats.total_entries);
    let _ = writeln!(out, "Wallets created:   {}", stats.wallet_creations);
    let _ = writeln!(out, "Keys decrypted:    {}", stats.keys_decrypted);
    let _ = writeln!(
        out,
        "Funds released:    {} (total {})",
        stats.funds_released_count, stats.funds_released_total
    );
    let _ = writeln!(
        out,
        "Funds refunded:    {} (total {})",
        stats.funds_refunded_count, stats.funds_refunded_total
    );
    let _ = writeln!(out, "Milestones paid:   {}", stats.milestones_released);
    let _ = writeln!(out, "Failed payouts:    {}", stats.failed_payouts);

    if !stats.by_action.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "By action:");
        for (action, count) in &stats.by_action {
            let _ = writeln!(out, "  {:<22}{}", action, count);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Entries (newest first):");
    for entry in entries {
        let _ = write!(
            out,
            "  {} {} escrow={} actor={}",
            entry.timestamp.to_rfc3339(),
            entry.action.name(),
            entry.escrow_id,
            entry.actor
        );
        if let Some(amount) = entry.amount {
            let _ = write!(out, " amount={}", amount);
        }
        if let Some(hash) = &entry.tx_hash {
            let _ = write!(out, " tx={}", hash);
        }
        let _ = writeln!(out);
    }

    out
}
