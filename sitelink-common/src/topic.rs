use crate::config::BrokerConfig;

/// Default topic prefix for all SiteLink traffic.
pub const TOPIC_PREFIX: &str = "sitelink/site";

/// Builder for the MQTT topics a site publishes to.
///
/// Topics follow the pattern `<prefix>/<site_id>/<channel>` where the
/// channel is `telemetry` or `status`. The telemetry topic may be pinned to
/// a fixed value per deployment.
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    prefix: String,
    site_id: u32,
    telemetry_override: Option<String>,
}

impl TopicBuilder {
    /// Create a topic builder for a site using the default prefix.
    pub fn new(site_id: u32) -> Self {
        Self {
            prefix: TOPIC_PREFIX.to_string(),
            site_id,
            telemetry_override: None,
        }
    }

    /// Create a topic builder from the broker section of the configuration.
    pub fn from_config(config: &BrokerConfig, site_id: u32) -> Self {
        Self {
            prefix: config.topic_prefix.trim_end_matches('/').to_string(),
            site_id,
            telemetry_override: config.topic.clone(),
        }
    }

    /// Topic that site payloads are published on.
    ///
    /// # Example
    /// ```
    /// use sitelink_common::topic::TopicBuilder;
    ///
    /// assert_eq!(TopicBuilder::new(42).telemetry(), "sitelink/site/42/telemetry");
    /// ```
    pub fn telemetry(&self) -> String {
        match &self.telemetry_override {
            Some(topic) => topic.clone(),
            None => format!("{}/{}/telemetry", self.prefix, self.site_id),
        }
    }

    /// Topic carrying the retained online/offline status of the agent.
    ///
    /// # Example
    /// ```
    /// use sitelink_common::topic::TopicBuilder;
    ///
    /// assert_eq!(TopicBuilder::new(42).status(), "sitelink/site/42/status");
    /// ```
    pub fn status(&self) -> String {
        format!("{}/{}/status", self.prefix, self.site_id)
    }

    /// MQTT filter matching the telemetry of every site under the prefix.
    pub fn all_sites_filter(&self) -> String {
        format!("{}/+/telemetry", self.prefix)
    }
}

/// Parse a topic built by [`TopicBuilder`] back into site id and channel.
///
/// Returns `None` for topics outside the default prefix.
pub fn parse_topic(topic: &str) -> Option<ParsedTopic<'_>> {
    let rest = topic.strip_prefix(TOPIC_PREFIX)?.strip_prefix('/')?;
    let (site, channel) = rest.split_once('/')?;
    let site_id = site.parse().ok()?;

    match channel {
        "telemetry" | "status" => Some(ParsedTopic { site_id, channel }),
        _ => None,
    }
}

/// Parsed components of a SiteLink topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic<'a> {
    pub site_id: u32,
    pub channel: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builder() {
        let builder = TopicBuilder::new(7);

        assert_eq!(builder.telemetry(), "sitelink/site/7/telemetry");
        assert_eq!(builder.status(), "sitelink/site/7/status");
        assert_eq!(builder.all_sites_filter(), "sitelink/site/+/telemetry");
    }

    #[test]
    fn test_topic_override_and_prefix() {
        let config = BrokerConfig {
            topic_prefix: "plant/north/".to_string(),
            topic: Some("ingest/site-7".to_string()),
            ..BrokerConfig::default()
        };
        let builder = TopicBuilder::from_config(&config, 7);

        assert_eq!(builder.telemetry(), "ingest/site-7");
        assert_eq!(builder.status(), "plant/north/7/status");
    }

    #[test]
    fn test_parse_topic() {
        let parsed = parse_topic("sitelink/site/42/telemetry").unwrap();
        assert_eq!(parsed.site_id, 42);
        assert_eq!(parsed.channel, "telemetry");
    }

    #[test]
    fn test_parse_invalid_topic() {
        assert!(parse_topic("invalid/topic").is_none());
        assert!(parse_topic("sitelink/site/abc/telemetry").is_none());
        assert!(parse_topic("sitelink/site/42/unknown").is_none());
    }
}
