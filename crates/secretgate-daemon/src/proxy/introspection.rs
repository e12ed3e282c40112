//! Locally answered standard interfaces: introspection data and the peer
//! machine id.

use std::fmt::Write as _;
use std::io;

use secretgate_core::path::SERVICE_ROOT;

use super::router::Route;

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

const DOCTYPE: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">"#;

const STANDARD: &str = r#"  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect"><arg name="xml_data" type="s" direction="out"/></method>
  </interface>
  <interface name="org.freedesktop.DBus.Peer">
    <method name="Ping"/>
    <method name="GetMachineId"><arg name="machine_uuid" type="s" direction="out"/></method>
  </interface>
"#;

const PROPERTIES: &str = r#"  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="property_name" type="s" direction="in"/>
      <arg name="value" type="v" direction="out"/>
    </method>
    <method name="Set">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="property_name" type="s" direction="in"/>
      <arg name="value" type="v" direction="in"/>
    </method>
    <method name="GetAll">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="props" type="a{sv}" direction="out"/>
    </method>
    <signal name="PropertiesChanged">
      <arg name="interface_name" type="s"/>
      <arg name="changed_properties" type="a{sv}"/>
      <arg name="invalidated_properties" type="as"/>
    </signal>
  </interface>
"#;

const SERVICE: &str = r#"  <interface name="org.freedesktop.Secret.Service">
    <method name="OpenSession">
      <arg name="algorithm" type="s" direction="in"/>
      <arg name="input" type="v" direction="in"/>
      <arg name="output" type="v" direction="out"/>
      <arg name="result" type="o" direction="out"/>
    </method>
    <method name="CreateCollection">
      <arg name="properties" type="a{sv}" direction="in"/>
      <arg name="alias" type="s" direction="in"/>
      <arg name="collection" type="o" direction="out"/>
      <arg name="prompt" type="o" direction="out"/>
    </method>
    <method name="SearchItems">
      <arg name="attributes" type="a{ss}" direction="in"/>
      <arg name="unlocked" type="ao" direction="out"/>
      <arg name="locked" type="ao" direction="out"/>
    </method>
    <method name="Unlock">
      <arg name="objects" type="ao" direction="in"/>
      <arg name="unlocked" type="ao" direction="out"/>
      <arg name="prompt" type="o" direction="out"/>
    </method>
    <method name="Lock">
      <arg name="objects" type="ao" direction="in"/>
      <arg name="locked" type="ao" direction="out"/>
      <arg name="Prompt" type="o" direction="out"/>
    </method>
    <method name="GetSecrets">
      <arg name="items" type="ao" direction="in"/>
      <arg name="session" type="o" direction="in"/>
      <arg name="secrets" type="a{o(oayays)}" direction="out"/>
    </method>
    <method name="ReadAlias">
      <arg name="name" type="s" direction="in"/>
      <arg name="collection" type="o" direction="out"/>
    </method>
    <method name="SetAlias">
      <arg name="name" type="s" direction="in"/>
      <arg name="collection" type="o" direction="in"/>
    </method>
    <property name="Collections" type="ao" access="read"/>
    <signal name="CollectionCreated"><arg name="collection" type="o"/></signal>
    <signal name="CollectionDeleted"><arg name="collection" type="o"/></signal>
    <signal name="CollectionChanged"><arg name="collection" type="o"/></signal>
  </interface>
"#;

const COLLECTION: &str = r#"  <interface name="org.freedesktop.Secret.Collection">
    <method name="Delete"><arg name="prompt" type="o" direction="out"/></method>
    <method name="SearchItems">
      <arg name="attributes" type="a{ss}" direction="in"/>
      <arg name="results" type="ao" direction="out"/>
    </method>
    <method name="CreateItem">
      <arg name="properties" type="a{sv}" direction="in"/>
      <arg name="secret" type="(oayays)" direction="in"/>
      <arg name="replace" type="b" direction="in"/>
      <arg name="item" type="o" direction="out"/>
      <arg name="prompt" type="o" direction="out"/>
    </method>
    <property name="Items" type="ao" access="read"/>
    <property name="Label" type="s" access="readwrite"/>
    <property name="Locked" type="b" access="read"/>
    <property name="Created" type="t" access="read"/>
    <property name="Modified" type="t" access="read"/>
    <signal name="ItemCreated"><arg name="item" type="o"/></signal>
    <signal name="ItemDeleted"><arg name="item" type="o"/></signal>
    <signal name="ItemChanged"><arg name="item" type="o"/></signal>
  </interface>
"#;

const ITEM: &str = r#"  <interface name="org.freedesktop.Secret.Item">
    <method name="Delete"><arg name="Prompt" type="o" direction="out"/></method>
    <method name="GetSecret">
      <arg name="session" type="o" direction="in"/>
      <arg name="secret" type="(oayays)" direction="out"/>
    </method>
    <method name="SetSecret"><arg name="secret" type="(oayays)" direction="in"/></method>
    <property name="Locked" type="b" access="read"/>
    <property name="Attributes" type="a{ss}" access="readwrite"/>
    <property name="Label" type="s" access="readwrite"/>
    <property name="Created" type="t" access="read"/>
    <property name="Modified" type="t" access="read"/>
  </interface>
"#;

const SESSION: &str = r#"  <interface name="org.freedesktop.Secret.Session">
    <method name="Close"/>
  </interface>
"#;

const PROMPT: &str = r#"  <interface name="org.freedesktop.Secret.Prompt">
    <method name="Prompt"><arg name="window-id" type="s" direction="in"/></method>
    <method name="Dismiss"/>
    <signal name="Completed">
      <arg name="dismissed" type="b"/>
      <arg name="result" type="v"/>
    </signal>
  </interface>
"#;

/// Builds the introspection document for `object`.
///
/// Ancestors of the service root list the next path segment as a child node
/// so tools can walk down to the service.
#[must_use]
pub fn document(route: Route, object: &str) -> String {
    let mut xml = String::with_capacity(4096);
    xml.push_str(DOCTYPE);
    xml.push_str("\n<node>\n");
    xml.push_str(STANDARD);

    match route {
        Route::Service => {
            xml.push_str(PROPERTIES);
            xml.push_str(SERVICE);
        },
        Route::Collection => {
            xml.push_str(PROPERTIES);
            xml.push_str(COLLECTION);
        },
        Route::Item => {
            xml.push_str(PROPERTIES);
            xml.push_str(ITEM);
        },
        Route::Session => xml.push_str(SESSION),
        Route::Prompt => xml.push_str(PROMPT),
        Route::Unknown => {
            if let Some(child) = child_towards_service(object) {
                let _ = writeln!(xml, "  <node name=\"{child}\"/>");
            }
        },
    }

    xml.push_str("</node>\n");
    xml
}

fn child_towards_service(object: &str) -> Option<&'static str> {
    let prefix = if object == "/" { "" } else { object };
    let rest = SERVICE_ROOT.strip_prefix(prefix)?.strip_prefix('/')?;
    rest.split('/').next().filter(|s| !s.is_empty())
}

/// Reads the local machine id.
///
/// # Errors
///
/// Returns the last read error if no machine id file is readable.
pub fn machine_id() -> io::Result<String> {
    let mut last = io::Error::new(io::ErrorKind::NotFound, "no machine id file");
    for path in MACHINE_ID_PATHS {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let id = content.trim();
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            },
            Err(e) => last = e,
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_document_lists_interfaces() {
        let xml = document(Route::Service, SERVICE_ROOT);
        assert!(xml.contains(r#"interface name="org.freedesktop.Secret.Service""#));
        assert!(xml.contains(r#"interface name="org.freedesktop.DBus.Properties""#));
        assert!(!xml.contains("org.freedesktop.Secret.Item\""));
    }

    #[test]
    fn test_session_has_no_properties() {
        let xml = document(Route::Session, "/org/freedesktop/secrets/session/s1");
        assert!(xml.contains("org.freedesktop.Secret.Session"));
        assert!(!xml.contains("org.freedesktop.DBus.Properties"));
    }

    #[test]
    fn test_ancestors_point_towards_service() {
        assert_eq!(child_towards_service("/"), Some("org"));
        assert_eq!(child_towards_service("/org"), Some("freedesktop"));
        assert_eq!(child_towards_service("/org/freedesktop"), Some("secrets"));
        assert_eq!(child_towards_service("/org/free"), None);
        assert_eq!(child_towards_service("/com"), None);

        let xml = document(Route::Unknown, "/org/freedesktop");
        assert!(xml.contains(r#"<node name="secrets"/>"#));
    }
}
