//! Client for a SuperBIG long-context memory service.

use crate::http::{ensure_success, join_url};
use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};

const SECTION_SEPARATOR: &str = "More information:";

#[derive(Debug, Serialize)]
struct GetMessagesRequest<'a> {
    chatlog: &'a str,
    last_messages: &'a str,
}

#[derive(Debug, Deserialize)]
struct GetMessagesResponse {
    #[serde(default)]
    text: String,
}

pub struct SuperBigClient {
    http: reqwest::Client,
    base_url: String,
}

impl SuperBigClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Fetches remembered passages relevant to `last_messages`.
    ///
    /// Sections come back most relevant first and are returned reversed, so
    /// the most relevant one ends up closest to the live chat.
    pub async fn get_messages(&self, chatlog: &str, last_messages: &str) -> Result<String> {
        let response = self
            .http
            .post(join_url(&self.base_url, "/api/get-messages"))
            .json(&GetMessagesRequest {
                chatlog,
                last_messages,
            })
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let body: GetMessagesResponse = response.json().await?;
        let text = reorder_sections(&body.text);
        debug!("SuperBIG returned:\n{}", text);
        Ok(text)
    }
}

fn reorder_sections(text: &str) -> String {
    let mut sections: Vec<&str> = text.split(SECTION_SEPARATOR).collect();
    sections.reverse();
    sections.join("\n")
}

#[cfg(test)]
mod tests {
    use super::reorder_sections;

    #[test]
    fn sections_are_reversed() {
        assert_eq!(
            reorder_sections("first\nMore information:second"),
            "second\nfirst\n"
        );
        assert_eq!(reorder_sections("only"), "only");
    }
}
