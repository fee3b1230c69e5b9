use crate::model::{ModuleStatus, ScanStatus, ScanStatusReport, ScanSummary};
use anyhow::Result;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ScanRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Tool")]
    tool: String,
    #[tabled(rename = "OS")]
    os: String,
    #[tabled(rename = "Results")]
    results: String,
    #[tabled(rename = "Created")]
    created: String,
}

#[derive(Tabled)]
struct ModuleRow {
    #[tabled(rename = "Module")]
    module: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Error")]
    error: String,
}

#[derive(Tabled)]
struct CatalogRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "Module")]
    module: String,
}

pub fn print_scans_table(scans: &[ScanSummary]) -> Result<()> {
    if scans.is_empty() {
        println!("No scans found.");
        return Ok(());
    }

    let rows: Vec<ScanRow> = scans
        .iter()
        .map(|s| ScanRow {
            id: s.scan.id.to_string(),
            name: truncate(&s.scan.display_name(), 30),
            status: format_scan_status(s.scan.status),
            tool: s.scan.variant.display_name().to_string(),
            os: s.scan.os.to_string(),
            results: s.valid_results.to_string(),
            created: s.scan.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

pub fn print_status_table(report: &ScanStatusReport) -> Result<()> {
    let scan = &report.scan;
    println!();
    println!("Scan {} ({})", scan.id, scan.display_name());
    println!(
        "Status: {}  |  {} {}  |  {}/{} modules finished  |  {} valid results",
        format_scan_status(scan.status),
        scan.variant.display_name(),
        scan.os,
        report.finished_modules(),
        report.modules.len(),
        report.valid_results
    );
    if let Some(error) = &scan.error {
        println!("Error: {}", error);
    }
    if report.soft_failure {
        println!("\x1b[33mWarning: no module produced usable output\x1b[0m");
    }
    println!();

    if report.modules.is_empty() {
        return Ok(());
    }

    let rows: Vec<ModuleRow> = report
        .modules
        .iter()
        .map(|m| ModuleRow {
            module: m.module.clone(),
            status: format_module_status(m.status),
            error: m
                .error_message
                .as_deref()
                .map(|e| truncate(e, 60))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

pub fn print_modules_table(modules: &[String]) -> Result<()> {
    let rows: Vec<CatalogRow> = modules
        .iter()
        .enumerate()
        .map(|(i, module)| CatalogRow {
            position: i + 1,
            module: module.clone(),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

fn format_scan_status(status: ScanStatus) -> String {
    match status {
        ScanStatus::Pending => "pending".to_string(),
        ScanStatus::Running => "\x1b[36mrunning\x1b[0m".to_string(),
        ScanStatus::Completed => "\x1b[32mcompleted\x1b[0m".to_string(),
        ScanStatus::Failed => "\x1b[31mfailed\x1b[0m".to_string(),
    }
}

fn format_module_status(status: ModuleStatus) -> String {
    match status {
        ModuleStatus::Pending => "PENDING".to_string(),
        ModuleStatus::Running => "\x1b[36mRUNNING\x1b[0m".to_string(),
        ModuleStatus::Completed => "\x1b[32mCOMPLETED\x1b[0m".to_string(),
        ModuleStatus::Failed => "\x1b[31mFAILED\x1b[0m".to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
