//! Host tag configuration.
//!
//! Tag groups are exclusive choices (a host carries exactly one tag of each
//! group); auxiliary tags are standalone markers such as `ping`.

use serde::{Deserialize, Serialize};

/// One selectable tag of a tag group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagChoice {
    /// Tag id.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Auxiliary tags implied by choosing this tag.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aux_tags: Vec<String>,
}

/// An exclusive group of tags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagGroup {
    /// Group id (the attribute is named `tag_<id>`).
    pub id: String,
    /// Display title.
    pub title: String,
    /// Choices; the first one is the default.
    pub tags: Vec<TagChoice>,
}

impl TagGroup {
    /// Returns the default tag id of this group.
    pub fn default_tag(&self) -> Option<&str> {
        self.tags.first().map(|t| t.id.as_str())
    }

    /// Returns true if `tag` is one of this group's choices.
    pub fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.id == tag)
    }
}

/// An auxiliary tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxTag {
    /// Tag id.
    pub id: String,
    /// Display title.
    pub title: String,
}

/// Complete tag configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagConfig {
    /// Tag groups in display order.
    pub tag_groups: Vec<TagGroup>,
    /// Auxiliary tags.
    pub aux_tags: Vec<AuxTag>,
}

fn group(id: &str, title: &str, tags: &[(&str, &str, &[&str])]) -> TagGroup {
    TagGroup {
        id: id.to_string(),
        title: title.to_string(),
        tags: tags
            .iter()
            .map(|(id, title, aux)| TagChoice {
                id: id.to_string(),
                title: title.to_string(),
                aux_tags: aux.iter().map(|a| a.to_string()).collect(),
            })
            .collect(),
    }
}

impl TagConfig {
    /// The tag groups every installation ships with.
    pub fn builtin() -> Self {
        Self {
            tag_groups: vec![
                group(
                    "agent",
                    "Checkmk agent / API integrations",
                    &[
                        ("cmk-agent", "API integrations if configured, else Checkmk agent", &["tcp", "checkmk-agent"]),
                        ("all-agents", "Configured API integrations and Checkmk agent", &["tcp", "checkmk-agent"]),
                        ("special-agents", "Configured API integrations, no Checkmk agent", &["tcp"]),
                        ("no-agent", "No API integrations, no Checkmk agent", &[]),
                    ],
                ),
                group(
                    "snmp_ds",
                    "SNMP",
                    &[
                        ("no-snmp", "No SNMP", &[]),
                        ("snmp-v2", "SNMP v2 or v3", &["snmp"]),
                        ("snmp-v1", "SNMP v1", &["snmp"]),
                    ],
                ),
                group(
                    "address_family",
                    "IP address family",
                    &[
                        ("ip-v4-only", "IPv4 only", &["ip-v4"]),
                        ("ip-v6-only", "IPv6 only", &["ip-v6"]),
                        ("ip-v4v6", "IPv4/IPv6 dual-stack", &["ip-v4", "ip-v6"]),
                        ("no-ip", "No IP", &[]),
                    ],
                ),
                group(
                    "piggyback",
                    "Piggyback",
                    &[
                        ("auto-piggyback", "Use piggyback data from other hosts if present", &[]),
                        ("piggyback", "Always use and expect piggyback data", &[]),
                        ("no-piggyback", "Never use piggyback data", &[]),
                    ],
                ),
                group(
                    "criticality",
                    "Criticality",
                    &[
                        ("prod", "Productive system", &[]),
                        ("critical", "Business critical", &[]),
                        ("test", "Test system", &[]),
                        ("offline", "Do not monitor this host", &[]),
                    ],
                ),
                group(
                    "networking",
                    "Networking segment",
                    &[
                        ("lan", "Local network (low latency)", &[]),
                        ("wan", "WAN (high latency)", &[]),
                        ("dmz", "DMZ (low latency, secure access)", &[]),
                    ],
                ),
            ],
            aux_tags: ["ping", "tcp", "snmp", "ip-v4", "ip-v6", "checkmk-agent"]
                .iter()
                .map(|id| AuxTag {
                    id: id.to_string(),
                    title: id.to_string(),
                })
                .collect(),
        }
    }

    /// Returns the auxiliary tags implied by `tag` of group `group`.
    pub fn implied_aux_tags(&self, group: &str, tag: &str) -> Vec<String> {
        self.tag_group(group)
            .and_then(|g| g.tags.iter().find(|t| t.id == tag))
            .map(|t| t.aux_tags.clone())
            .unwrap_or_default()
    }

    /// Looks up a tag group by id.
    pub fn tag_group(&self, id: &str) -> Option<&TagGroup> {
        self.tag_groups.iter().find(|g| g.id == id)
    }

    /// Returns true if `id` is an auxiliary tag.
    pub fn is_aux_tag(&self, id: &str) -> bool {
        self.aux_tags.iter().any(|t| t.id == id)
    }

    /// Resolves the group a tag belongs to. Auxiliary tags form a group of
    /// their own, named after the tag.
    pub fn group_of_tag(&self, tag: &str) -> Option<&str> {
        if let Some(group) = self.tag_groups.iter().find(|g| g.contains(tag)) {
            return Some(group.id.as_str());
        }
        self.aux_tags
            .iter()
            .find(|t| t.id == tag)
            .map(|t| t.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        let config = TagConfig::builtin();
        assert_eq!(
            config.tag_group("agent").unwrap().default_tag(),
            Some("cmk-agent")
        );
        assert_eq!(
            config.tag_group("snmp_ds").unwrap().default_tag(),
            Some("no-snmp")
        );
        assert!(config.tag_group("unknown").is_none());
    }

    #[test]
    fn test_group_of_tag() {
        let config = TagConfig::builtin();
        assert_eq!(config.group_of_tag("lan"), Some("networking"));
        assert_eq!(config.group_of_tag("no-agent"), Some("agent"));
        assert_eq!(config.group_of_tag("ping"), Some("ping"));
        assert_eq!(config.group_of_tag("nonsense"), None);
        assert!(config.is_aux_tag("tcp"));
    }

    #[test]
    fn test_implied_aux_tags() {
        let config = TagConfig::builtin();
        assert_eq!(
            config.implied_aux_tags("agent", "cmk-agent"),
            vec!["tcp", "checkmk-agent"]
        );
        assert_eq!(
            config.implied_aux_tags("address_family", "ip-v4v6"),
            vec!["ip-v4", "ip-v6"]
        );
        assert!(config.implied_aux_tags("snmp_ds", "no-snmp").is_empty());
    }
}
