//! Built-in resource kinds
//!
//! Each kind is declared as data. Adding a kind means adding a schema here;
//! nothing else in the engine changes.

use crate::error::Result;
use crate::location::LocationKind;
use crate::schema::{Attribute, NodeType, ObjectSchema, Reference, Schema, SchemaRegistry, SchemaRegistryBuilder};

const DESCRIPTION_MAX_LEN: usize = 1023;

/// Object scopes: shared, a device group, or a template vsys
const OBJECT_LOCATIONS: &[LocationKind] = &[
    LocationKind::Shared,
    LocationKind::DeviceGroup,
    LocationKind::Template,
];

const PANORAMA: &[LocationKind] = &[LocationKind::Panorama];

/// Registry with every built-in kind
pub fn builtin_registry() -> SchemaRegistry {
    register_builtins(SchemaRegistry::builder())
        .expect("built-in schemas are well-formed")
        .build()
}

/// Add the built-in kinds to an existing builder
pub fn register_builtins(builder: SchemaRegistryBuilder) -> Result<SchemaRegistryBuilder> {
    builder
        .register(tag())?
        .register(address())?
        .register(address_group())?
        .register(service())?
        .register(device_group())?
        .register(template())?
        .register(template_stack())?
        .register(security_policy())?
        .register(bgp_export_rules())?
        .register(api_key())
}

fn description() -> Attribute {
    Attribute::optional("description", NodeType::bounded_string(DESCRIPTION_MAX_LEN))
}

fn tags() -> Attribute {
    Attribute::optional("tags", NodeType::set(NodeType::reference(Reference::to(&["tag"]))))
}

fn tag() -> Schema {
    let colors: Vec<String> = (1..=17).map(|i| format!("color{i}")).collect();
    let colors: Vec<&str> = colors.iter().map(String::as_str).collect();
    Schema::new(
        "tag",
        OBJECT_LOCATIONS,
        ObjectSchema::new()
            .attr(Attribute::optional("color", NodeType::one_of(&colors)))
            .attr(Attribute::optional("comments", NodeType::bounded_string(DESCRIPTION_MAX_LEN))),
    )
    .describe("Administrative tag")
    .name_max_len(127)
}

fn address() -> Schema {
    Schema::new(
        "address",
        OBJECT_LOCATIONS,
        ObjectSchema::new()
            .attr(description())
            .attr(tags())
            .one_of("value")
            .attr(Attribute::variant("value", "ip_netmask", NodeType::string()))
            .attr(Attribute::variant("value", "ip_range", NodeType::string()))
            .attr(Attribute::variant("value", "ip_wildcard", NodeType::string()))
            .attr(Attribute::variant("value", "fqdn", NodeType::bounded_string(255))),
    )
    .describe("Address object")
}

fn address_group() -> Schema {
    let dynamic = ObjectSchema::new().attr(Attribute::required("filter", NodeType::bounded_string(2047)));
    Schema::new(
        "address_group",
        OBJECT_LOCATIONS,
        ObjectSchema::new()
            .attr(description())
            .attr(tags())
            .one_of("members")
            .attr(Attribute::variant(
                "members",
                "static",
                NodeType::set(NodeType::reference(Reference::to(&["address", "address_group"]))),
            ))
            .attr(Attribute::variant("members", "dynamic", NodeType::object(dynamic))),
    )
    .describe("Static or dynamic group of addresses")
}

fn service() -> Schema {
    let ports = || {
        ObjectSchema::new()
            .attr(Attribute::required("destination_port", NodeType::bounded_string(1023)))
            .attr(Attribute::optional("source_port", NodeType::bounded_string(1023)))
    };
    Schema::new(
        "service",
        OBJECT_LOCATIONS,
        ObjectSchema::new()
            .attr(description())
            .attr(tags())
            .attr(Attribute::optional("timeout", NodeType::int_range(1, 604_800)))
            .one_of("protocol")
            .attr(Attribute::variant("protocol", "tcp", NodeType::object(ports())))
            .attr(Attribute::variant("protocol", "udp", NodeType::object(ports()))),
    )
    .describe("TCP or UDP service")
}

fn device_group() -> Schema {
    Schema::new(
        "device_group",
        PANORAMA,
        ObjectSchema::new()
            .attr(description())
            .attr(Attribute::optional(
                "parent",
                NodeType::reference(Reference::to(&["device_group"])),
            )),
    )
    .describe("Panorama device group")
}

fn template() -> Schema {
    Schema::new(
        "template",
        PANORAMA,
        ObjectSchema::new()
            .attr(description())
            .attr(Attribute::optional(
                "default_vsys",
                NodeType::bounded_string(31),
            )),
    )
    .describe("Panorama template")
}

fn template_stack() -> Schema {
    Schema::new(
        "template_stack",
        PANORAMA,
        ObjectSchema::new()
            .attr(description())
            .attr(Attribute::optional(
                "templates",
                NodeType::list(NodeType::reference(Reference::to(&["template"]))),
            )),
    )
    .describe("Ordered stack of templates")
}

fn security_policy() -> Schema {
    let addresses = || {
        NodeType::set(NodeType::reference(
            Reference::to(&["address", "address_group"]).with_wildcard("any"),
        ))
    };
    let rule = ObjectSchema::new()
        .attr(Attribute::required("name", NodeType::string()))
        .attr(description())
        .attr(tags())
        .attr(Attribute::optional("source_zones", NodeType::set(NodeType::string())))
        .attr(Attribute::optional("destination_zones", NodeType::set(NodeType::string())))
        .attr(Attribute::optional("source_addresses", addresses()))
        .attr(Attribute::optional("destination_addresses", addresses()))
        .attr(Attribute::optional(
            "services",
            NodeType::set(NodeType::reference(
                Reference::to(&["service"])
                    .with_wildcard("any")
                    .with_wildcard("application-default"),
            )),
        ))
        .attr(Attribute::optional("applications", NodeType::set(NodeType::string())))
        .attr(Attribute::required("action", NodeType::one_of(&["allow", "deny", "drop"])))
        .attr(Attribute::optional("disabled", NodeType::Bool).with_default(false))
        .attr(Attribute::computed("uuid", NodeType::string()));

    Schema::new(
        "security_policy",
        &[LocationKind::Shared, LocationKind::DeviceGroup],
        ObjectSchema::new().attr(Attribute::optional(
            "rules",
            NodeType::list(NodeType::object(rule)),
        )),
    )
    .describe("Ordered security rulebase")
    .ordered("rules", "security_rule")
}

fn bgp_export_rules() -> Schema {
    let as_path = ObjectSchema::new()
        .at_most_one_of("type")
        .attr(Attribute::variant("type", "none", NodeType::marker()))
        .attr(Attribute::variant("type", "remove", NodeType::marker()))
        .attr(Attribute::variant("type", "prepend", NodeType::int_range(1, 255)))
        .attr(Attribute::variant("type", "remove_and_prepend", NodeType::int_range(1, 255)));
    let update = ObjectSchema::new()
        .attr(Attribute::optional("as_path", NodeType::object(as_path)))
        .attr(Attribute::optional("local_preference", NodeType::int_range(0, 4_294_967_295)))
        .attr(Attribute::optional("med", NodeType::int_range(0, 4_294_967_295)))
        .attr(Attribute::optional("community", NodeType::set(NodeType::string())));
    let allow = ObjectSchema::new().attr(Attribute::optional("update", NodeType::object(update)));
    let action = ObjectSchema::new()
        .one_of("type")
        .attr(Attribute::variant("type", "allow", NodeType::object(allow)))
        .attr(Attribute::variant("type", "deny", NodeType::marker()));
    let matching = ObjectSchema::new()
        .attr(Attribute::optional("address_prefixes", NodeType::set(NodeType::string())))
        .attr(Attribute::optional("from_peers", NodeType::set(NodeType::string())));
    let rule = ObjectSchema::new()
        .attr(Attribute::required("name", NodeType::string()))
        .attr(Attribute::optional("enable", NodeType::Bool).with_default(true))
        .attr(Attribute::optional("used_by", NodeType::set(NodeType::string())))
        .attr(Attribute::optional("match", NodeType::object(matching)))
        .attr(Attribute::required("action", NodeType::object(action)));

    Schema::new(
        "bgp_export_rules",
        &[LocationKind::Template],
        ObjectSchema::new().attr(Attribute::optional(
            "rules",
            NodeType::list(NodeType::object(rule)),
        )),
    )
    .describe("Ordered BGP export policy of a virtual router")
    .ordered("rules", "bgp_export_rule")
}

fn api_key() -> Schema {
    Schema::new(
        "api_key",
        PANORAMA,
        ObjectSchema::new()
            .attr(Attribute::required("username", NodeType::string()))
            .attr(Attribute::required("password", NodeType::string()).sensitive())
            .attr(Attribute::computed("key", NodeType::string()).sensitive()),
    )
    .describe("API key issued for a user")
    .ephemeral()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_register() {
        let registry = builtin_registry();
        for kind in [
            "address",
            "address_group",
            "service",
            "tag",
            "device_group",
            "template",
            "template_stack",
            "security_policy",
            "security_rule",
            "bgp_export_rules",
            "bgp_export_rule",
            "api_key",
        ] {
            assert!(registry.contains(kind), "{kind} missing");
        }
    }

    #[test]
    fn test_element_kinds_point_at_collection() {
        let registry = builtin_registry();
        let rule = registry.lookup("security_rule").unwrap();
        assert_eq!(rule.element_of.as_deref(), Some("security_policy"));
        assert!(rule.body.attribute("uuid").unwrap().is_computed());
    }

    #[test]
    fn test_api_key_is_ephemeral_and_sensitive() {
        let registry = builtin_registry();
        let schema = registry.lookup("api_key").unwrap();
        assert!(schema.ephemeral);
        assert!(schema.body.attribute("password").unwrap().sensitive);
    }
}
