use colored::Colorize;

fn main() {
    if let Err(e) = dsr_runner::run() {
        eprintln!("{}: {e:#}", "Error".red());
        std::process::exit(1);
    }
}
