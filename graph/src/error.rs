use colored::Colorize;

/// For re-throwing after a list of errors has been collected.
/// The message names every underlying failure.
#[derive(Debug, thiserror::Error)]
#[error("{label} failed due to {} errors: {}", .messages.len(), .messages.join("; "))]
pub struct AggregatedErrors {
    pub label: String,
    pub messages: Vec<String>,
}

/// Collects errors so they can all be reported at once
/// instead of failing on the first one.
// in future we can add a `warnings` field, too.
pub struct Errors {
    errors: Vec<anyhow::Error>,
}

impl Default for Errors {
    fn default() -> Self {
        Self {
            // ideally we won't have any,
            // and we don't mind reallocating if we're already in an error state:
            errors: Vec::with_capacity(0),
        }
    }
}

impl Errors {
    pub fn add(&mut self, e: impl Into<anyhow::Error>) {
        let e = e.into();
        log::trace!("error: {e:?}");
        self.errors.push(e);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Print the full list of errors to stderr.
    pub fn print_recap(&self, label: &str) {
        if !self.errors.is_empty() {
            eprintln!("\n{} {}:\n", "Encountered errors while".red(), label.red());
            for e in &self.errors {
                eprintln!("{}: {e:#}", "ERROR".red());
            }
            eprintln!();
        }
    }

    /// Fail with an aggregated error if there were one or more errors.
    pub fn into_result(self, label: &str) -> Result<(), AggregatedErrors> {
        if self.errors.is_empty() {
            return Ok(());
        }
        for e in &self.errors {
            log::warn!("{label}: {e:#}");
        }
        Err(AggregatedErrors {
            label: label.to_owned(),
            messages: self.errors.iter().map(|e| format!("{e:#}")).collect(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_aggregate_names_every_error() {
        let mut errors = Errors::default();
        assert!(errors.is_empty());
        errors.add(anyhow::anyhow!("first"));
        errors.add(anyhow::anyhow!("second").context("while checking"));
        let e = errors.into_result("validating").unwrap_err();
        assert_eq!(e.messages.len(), 2);
        let msg = e.to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("while checking: second"));
    }
}
