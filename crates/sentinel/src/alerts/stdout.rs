use async_trait::async_trait;

use super::{AlertChannel, AlertMessage};
use crate::{Error, Result};

/// Prints alerts to stdout, as JSON or as the rendered text.
#[derive(Debug)]
pub struct StdoutChannel {
    format: String, // "json" or "text"
    pretty: bool,   // For JSON output
}

impl StdoutChannel {
    pub fn new(format: Option<&str>, pretty: bool) -> Result<Self> {
        let format = format.unwrap_or("text").to_lowercase();
        if format != "json" && format != "text" {
            return Err(Error::Config(format!(
                "Invalid format for stdout channel: {}. Must be 'json' or 'text'",
                format
            )));
        }
        Ok(Self { format, pretty })
    }

    fn render(&self, message: &AlertMessage) -> Result<String> {
        match (self.format.as_str(), self.pretty) {
            ("json", true) => Ok(serde_json::to_string_pretty(message)?),
            ("json", false) => Ok(serde_json::to_string(message)?),
            _ => Ok(format!("{}\n{}", message.title, message.body)),
        }
    }
}

#[async_trait]
impl AlertChannel for StdoutChannel {
    fn name(&self) -> String {
        "stdout".to_string()
    }

    async fn deliver(&self, message: &AlertMessage) -> Result<()> {
        println!("{}", self.render(message)?);
        Ok(())
    }
}
