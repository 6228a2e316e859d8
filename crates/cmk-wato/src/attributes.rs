//! Typed host attribute registry.
//!
//! Each attribute type implements [`HostAttribute`] and opts into the
//! capabilities it needs: contributing tags ([`TagContributor`]),
//! synthesizing labels ([`LabelContributor`]) or exporting a flattened
//! value into the host file ([`ExportableAttribute`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::access::ContactGroupConfig;
use crate::config::Edition;
use crate::tags::{TagConfig, TagGroup};
use crate::types::*;

/// Replacement shown instead of secret attribute values.
pub const REDACTED: &str = "redacted";

/// Diff note used when only secret values changed.
pub const REDACTED_SECRETS_CHANGED: &str = "Redacted secrets changed.";

/// Attribute contributing host tags.
pub trait TagContributor {
    /// Returns `(tag group, tag)` pairs for the effective value.
    fn tags(&self, value: Option<&Value>) -> TagGroups;
}

/// Attribute synthesizing host labels.
pub trait LabelContributor {
    fn labels(&self, value: &Value) -> Labels;
}

/// Attribute exported into a flattened "attribute to host to value" map of
/// the host file.
pub trait ExportableAttribute {
    /// Name of the flattened map.
    fn export_key(&self) -> &'static str;
    /// The exported value, or None to omit the host.
    fn export_value(&self, value: &Value) -> Option<Value>;
}

/// A registered host attribute.
pub trait HostAttribute: Send + Sync {
    fn name(&self) -> &str;
    fn title(&self) -> &str;

    /// Default value filled into effective attributes when unset anywhere.
    fn default_value(&self) -> Option<Value> {
        None
    }

    /// Secret values are masked in diffs and change logs.
    fn is_secret(&self) -> bool {
        false
    }

    fn validate(&self, value: &Value) -> Result<()>;

    fn as_tag_contributor(&self) -> Option<&dyn TagContributor> {
        None
    }

    fn as_label_contributor(&self) -> Option<&dyn LabelContributor> {
        None
    }

    fn as_exportable(&self) -> Option<&dyn ExportableAttribute> {
        None
    }
}

fn expect_string<'a>(attr: &str, value: &'a Value) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        WatoError::user_input(format!("The attribute '{}' must be a string", attr))
    })
}

/// Plain text attribute, optionally exported.
pub struct TextAttribute {
    name: &'static str,
    title: &'static str,
    export: Option<&'static str>,
}

impl TextAttribute {
    pub fn new(name: &'static str, title: &'static str) -> Self {
        Self {
            name,
            title,
            export: None,
        }
    }

    pub fn exported_as(mut self, key: &'static str) -> Self {
        self.export = Some(key);
        self
    }
}

impl HostAttribute for TextAttribute {
    fn name(&self) -> &str {
        self.name
    }

    fn title(&self) -> &str {
        self.title
    }

    fn validate(&self, value: &Value) -> Result<()> {
        expect_string(self.name, value).map(|_| ())
    }

    fn as_exportable(&self) -> Option<&dyn ExportableAttribute> {
        self.export.map(|_| self as &dyn ExportableAttribute)
    }
}

impl ExportableAttribute for TextAttribute {
    fn export_key(&self) -> &'static str {
        self.export.unwrap_or(self.name)
    }

    fn export_value(&self, value: &Value) -> Option<Value> {
        match value.as_str() {
            Some("") | None => None,
            Some(s) => Some(Value::String(s.to_string())),
        }
    }
}

/// Secret-bearing attribute (SNMP communities, credentials).
pub struct SecretAttribute {
    name: &'static str,
    title: &'static str,
    export: &'static str,
}

impl SecretAttribute {
    pub fn new(name: &'static str, title: &'static str, export: &'static str) -> Self {
        Self {
            name,
            title,
            export,
        }
    }
}

impl HostAttribute for SecretAttribute {
    fn name(&self) -> &str {
        self.name
    }

    fn title(&self) -> &str {
        self.title
    }

    fn is_secret(&self) -> bool {
        true
    }

    fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::String(_) | Value::Object(_) => Ok(()),
            _ => Err(WatoError::user_input(format!(
                "The attribute '{}' must be a community string or a credential mapping",
                self.name
            ))),
        }
    }

    fn as_exportable(&self) -> Option<&dyn ExportableAttribute> {
        Some(self)
    }
}

impl ExportableAttribute for SecretAttribute {
    fn export_key(&self) -> &'static str {
        self.export
    }

    fn export_value(&self, value: &Value) -> Option<Value> {
        Some(value.clone())
    }
}

/// Monitoring site of a host. Produces the `cmk/site` label.
pub struct SiteAttribute {
    default_site: String,
}

impl SiteAttribute {
    pub fn new(default_site: impl Into<String>) -> Self {
        Self {
            default_site: default_site.into(),
        }
    }
}

impl HostAttribute for SiteAttribute {
    fn name(&self) -> &str {
        "site"
    }

    fn title(&self) -> &str {
        "Monitored on site"
    }

    fn default_value(&self) -> Option<Value> {
        Some(Value::String(self.default_site.clone()))
    }

    fn validate(&self, value: &Value) -> Result<()> {
        expect_string("site", value).map(|_| ())
    }

    fn as_label_contributor(&self) -> Option<&dyn LabelContributor> {
        Some(self)
    }
}

impl LabelContributor for SiteAttribute {
    fn labels(&self, value: &Value) -> Labels {
        let mut labels = Labels::new();
        if let Some(site) = value.as_str() {
            labels.insert("cmk/site".to_string(), site.to_string());
        }
        labels
    }
}

/// List of parent host names.
pub struct ParentsAttribute;

impl HostAttribute for ParentsAttribute {
    fn name(&self) -> &str {
        "parents"
    }

    fn title(&self) -> &str {
        "Parents"
    }

    fn default_value(&self) -> Option<Value> {
        Some(Value::Array(Vec::new()))
    }

    fn validate(&self, value: &Value) -> Result<()> {
        let ok = value
            .as_array()
            .map(|items| items.iter().all(Value::is_string))
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(WatoError::user_input(
                "The attribute 'parents' must be a list of host names",
            ))
        }
    }
}

/// Returns the parent host names stored in an attribute map.
pub fn parents_of(attributes: &Attributes) -> Vec<String> {
    attributes
        .get("parents")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Permitted and assigned contact groups.
pub struct ContactGroupsAttribute;

impl HostAttribute for ContactGroupsAttribute {
    fn name(&self) -> &str {
        "contactgroups"
    }

    fn title(&self) -> &str {
        "Permissions"
    }

    fn default_value(&self) -> Option<Value> {
        serde_json::to_value(ContactGroupConfig::default()).ok()
    }

    fn validate(&self, value: &Value) -> Result<()> {
        serde_json::from_value::<ContactGroupConfig>(value.clone())
            .map(|_| ())
            .map_err(|e| WatoError::user_input(format!("Invalid contact group setting: {}", e)))
    }
}

/// Explicit host labels.
pub struct LabelsAttribute;

impl HostAttribute for LabelsAttribute {
    fn name(&self) -> &str {
        "labels"
    }

    fn title(&self) -> &str {
        "Labels"
    }

    fn validate(&self, value: &Value) -> Result<()> {
        let ok = value
            .as_object()
            .map(|map| map.values().all(Value::is_string))
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(WatoError::user_input(
                "The attribute 'labels' must map label keys to string values",
            ))
        }
    }

    fn as_label_contributor(&self) -> Option<&dyn LabelContributor> {
        Some(self)
    }
}

impl LabelContributor for LabelsAttribute {
    fn labels(&self, value: &Value) -> Labels {
        value
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The `tag_<group>` attribute of one tag group.
pub struct TagGroupAttribute {
    attr_name: String,
    group: TagGroup,
    tag_config: Arc<TagConfig>,
}

impl TagGroupAttribute {
    pub fn new(group: TagGroup, tag_config: Arc<TagConfig>) -> Self {
        Self {
            attr_name: format!("tag_{}", group.id),
            group,
            tag_config,
        }
    }
}

impl HostAttribute for TagGroupAttribute {
    fn name(&self) -> &str {
        &self.attr_name
    }

    fn title(&self) -> &str {
        &self.group.title
    }

    fn default_value(&self) -> Option<Value> {
        self.group
            .default_tag()
            .map(|t| Value::String(t.to_string()))
    }

    fn validate(&self, value: &Value) -> Result<()> {
        let tag = expect_string(&self.attr_name, value)?;
        if self.group.contains(tag) {
            Ok(())
        } else {
            Err(WatoError::user_input(format!(
                "The tag '{}' is not a member of the tag group '{}'",
                tag, self.group.id
            )))
        }
    }

    fn as_tag_contributor(&self) -> Option<&dyn TagContributor> {
        Some(self)
    }
}

impl TagContributor for TagGroupAttribute {
    fn tags(&self, value: Option<&Value>) -> TagGroups {
        let mut tags = TagGroups::new();
        let tag = value
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.group.default_tag().map(str::to_string));
        if let Some(tag) = tag {
            for aux in self.tag_config.implied_aux_tags(&self.group.id, &tag) {
                tags.insert(aux.clone(), aux);
            }
            tags.insert(self.group.id.clone(), tag);
        }
        tags
    }
}

/// Registry of all known host attributes, keyed by name.
pub struct AttributeRegistry {
    attributes: BTreeMap<String, Box<dyn HostAttribute>>,
}

impl AttributeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            attributes: BTreeMap::new(),
        }
    }

    /// The built-in attributes plus one `tag_<group>` attribute per tag group.
    pub fn builtin(site_id: &str, tag_config: Arc<TagConfig>) -> Self {
        let mut registry = Self::new();
        registry.register(TextAttribute::new("alias", "Alias"));
        registry.register(TextAttribute::new("ipaddress", "IPv4 address").exported_as("ipaddresses"));
        registry.register(TextAttribute::new("ipv6address", "IPv6 address").exported_as("ipv6addresses"));
        registry.register(SiteAttribute::new(site_id));
        registry.register(ParentsAttribute);
        registry.register(ContactGroupsAttribute);
        registry.register(LabelsAttribute);
        registry.register(SecretAttribute::new(
            "snmp_community",
            "SNMP credentials",
            "explicit_snmp_communities",
        ));
        registry.register(
            TextAttribute::new("management_address", "Management board address")
                .exported_as("management_ip_addresses"),
        );
        registry.register(
            TextAttribute::new("management_protocol", "Management board protocol")
                .exported_as("management_protocol"),
        );
        registry.register(SecretAttribute::new(
            "management_snmp_community",
            "Management board SNMP credentials",
            "management_snmp_credentials",
        ));
        for group in &tag_config.tag_groups {
            registry.register(TagGroupAttribute::new(group.clone(), tag_config.clone()));
        }
        registry
    }

    pub fn register<A: HostAttribute + 'static>(&mut self, attribute: A) {
        self.attributes
            .insert(attribute.name().to_string(), Box::new(attribute));
    }

    pub fn get(&self, name: &str) -> Option<&dyn HostAttribute> {
        self.attributes.get(name).map(|a| a.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn HostAttribute> {
        self.attributes.values().map(|a| a.as_ref())
    }

    /// Default values of every attribute declaring one.
    pub fn defaults(&self) -> Attributes {
        self.iter()
            .filter_map(|a| a.default_value().map(|v| (a.name().to_string(), v)))
            .collect()
    }

    /// Validates every known attribute in the map. Unknown attributes are
    /// passed through untouched.
    pub fn validate(&self, attributes: &Attributes) -> Result<()> {
        for (name, value) in attributes {
            if let Some(attr) = self.get(name) {
                attr.validate(value)?;
            }
        }
        Ok(())
    }

    /// Replaces secret values by [`REDACTED`].
    pub fn mask_secrets(&self, attributes: &Attributes) -> Attributes {
        attributes
            .iter()
            .map(|(name, value)| {
                let secret = self.get(name).map(|a| a.is_secret()).unwrap_or(false);
                if secret {
                    (name.clone(), Value::String(REDACTED.to_string()))
                } else {
                    (name.clone(), value.clone())
                }
            })
            .collect()
    }

    /// Diff between two attribute maps with secrets masked. If masking hides
    /// a change, the generic [`REDACTED_SECRETS_CHANGED`] note is returned.
    pub fn redacted_diff(&self, old: &Attributes, new: &Attributes) -> Option<String> {
        let masked = make_diff_text(&self.mask_secrets(old), &self.mask_secrets(new));
        let unmasked = make_diff_text(old, new);
        if masked == unmasked {
            masked
        } else {
            Some(REDACTED_SECRETS_CHANGED.to_string())
        }
    }
}

impl Default for AttributeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable diff of two attribute maps, None if equal.
pub fn make_diff_text(old: &Attributes, new: &Attributes) -> Option<String> {
    let mut lines = Vec::new();
    for (name, value) in new {
        match old.get(name) {
            None => lines.push(format!("Attribute \"{}\" with value {} added.", name, value)),
            Some(prev) if prev != value => lines.push(format!(
                "Attribute \"{}\" with value {} changed to {}.",
                name, prev, value
            )),
            Some(_) => {}
        }
    }
    for (name, value) in old {
        if !new.contains_key(name) {
            lines.push(format!("Attribute \"{}\" with value {} removed.", name, value));
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Edition-specific validation of folder attributes.
pub trait FolderAttributeValidator: Send + Sync {
    fn validate(&self, parent_path: &str, attributes: &Attributes) -> Result<()>;
}

/// Validates attribute values against the registry.
pub struct RegistryValidator {
    registry: Arc<AttributeRegistry>,
}

impl FolderAttributeValidator for RegistryValidator {
    fn validate(&self, _parent_path: &str, attributes: &Attributes) -> Result<()> {
        self.registry.validate(attributes)
    }
}

/// Managed edition: the `customer` attribute must be a valid customer id.
pub struct CustomerValidator;

fn is_customer_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl FolderAttributeValidator for CustomerValidator {
    fn validate(&self, _parent_path: &str, attributes: &Attributes) -> Result<()> {
        match attributes.get("customer") {
            None => Ok(()),
            Some(Value::String(c)) if is_customer_id(c) => Ok(()),
            Some(other) => Err(WatoError::user_input(format!(
                "Invalid customer {}",
                other
            ))),
        }
    }
}

/// The validator set of an edition.
pub fn validators_for_edition(
    edition: Edition,
    registry: Arc<AttributeRegistry>,
) -> Vec<Box<dyn FolderAttributeValidator>> {
    let mut validators: Vec<Box<dyn FolderAttributeValidator>> =
        vec![Box::new(RegistryValidator { registry })];
    if edition == Edition::Managed {
        validators.push(Box::new(CustomerValidator));
    }
    validators
}
