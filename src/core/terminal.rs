use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏰ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_link(label: &str, url: &str) {
    println!(
        "  {} {}: {}",
        GLOBE,
        style(label).bold(),
        style(url).underlined().cyan()
    );
}

pub fn print_schedule_line(id: &str, when: &str, kind: &str, description: &str) {
    println!(
        "  {} {} {} {} {}",
        CLOCK,
        style(when).bold(),
        style(format!("[{}]", kind)).dim(),
        description,
        style(id).dim()
    );
}

pub fn print_help() {
    println!("\n{}", style("agentdeck").bold().cyan());
    println!("Chat agent with tool confirmation, deferred tasks and durable ingestion.\n");
    println!("{}", style("Commands:").bold());
    println!(
        "  {}  Start the API server and scheduler",
        style("serve [--api-host H] [--api-port P]").green()
    );
    println!(
        "  {}                Ingest a document into the knowledge base",
        style("ingest --text T").green()
    );
    println!(
        "  {}                      List active schedules",
        style("schedules").green()
    );
    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("agentdeck").green()
    );
}
