use studyrun_client::Ux;

/// Prints what a page would show to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleUx;

impl Ux for ConsoleUx {
    fn show_overlay(&self, text: &str) {
        eprintln!("  … {text}");
    }

    fn hide_overlay(&self) {}

    fn set_before_unload_warning(&self, enabled: bool) {
        tracing::debug!(
            component = "cli",
            event = "cli.before_unload",
            enabled,
            "Leave-page warning toggled"
        );
    }

    fn show_invalid_run(&self) {
        eprintln!("  This study run is no longer valid.");
    }

    fn navigate(&self, url: &str) {
        println!("{url}");
    }
}
