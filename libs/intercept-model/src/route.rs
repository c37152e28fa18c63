use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport protocol of a single redirection.
///
/// The wire format is an open string so that a driver publishing a protocol
/// we don't know about degrades into a logged skip instead of rejecting the
/// whole table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Proto {
    Tcp,
    Udp,
    Other(String),
}

impl Default for Proto {
    fn default() -> Self {
        Proto::Other(String::new())
    }
}

impl From<String> for Proto {
    fn from(s: String) -> Self {
        match s.as_str() {
            "tcp" => Proto::Tcp,
            "udp" => Proto::Udp,
            _ => Proto::Other(s),
        }
    }
}

impl From<Proto> for String {
    fn from(proto: Proto) -> Self {
        match proto {
            Proto::Tcp => "tcp".to_owned(),
            Proto::Udp => "udp".to_owned(),
            Proto::Other(s) => s,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => f.write_str("tcp"),
            Proto::Udp => f.write_str("udp"),
            Proto::Other(s) => f.write_str(s),
        }
    }
}

/// One redirection: a DNS binding, a synthetic local IP and the destination
/// the kernel should hand packets for that IP to.
///
/// An empty `target` makes this a DNS-only route: the name resolves but no
/// packet-redirect rule is installed for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Route {
    /// FQDN without trailing dot. Empty for routes that only NAT.
    pub name: String,
    /// Synthetic IPv4 the service is assigned on the workstation.
    pub ip: String,
    pub proto: Proto,
    /// `host:port` the redirected flow is forwarded to. Empty for DNS-only.
    pub target: String,
    /// Opaque tag assigned by the driver, echoed back on render.
    pub action: String,
}

impl Route {
    /// The registry key for this route: lowercased name with trailing dot.
    pub fn domain(&self) -> String {
        let mut domain = self.name.to_lowercase();
        domain.push('.');
        domain
    }
}

/// Named collection of routes, the unit of declarative configuration.
///
/// Route names are unique within a table; the table named [`Table::BOOTSTRAP`]
/// is reserved and survives wildcard deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Table {
    pub name: String,
    pub routes: Vec<Route>,
}

impl Table {
    pub const BOOTSTRAP: &'static str = "bootstrap";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_pascal_case() {
        let json = r#"{"Name":"web","Ip":"10.0.0.1","Proto":"tcp","Target":"127.0.0.1:9000","Action":"proxy"}"#;

        let route = serde_json::from_str::<Route>(json).unwrap();

        assert_eq!(route.name, "web");
        assert_eq!(route.ip, "10.0.0.1");
        assert_eq!(route.proto, Proto::Tcp);
        assert_eq!(route.target, "127.0.0.1:9000");
        assert_eq!(route.action, "proxy");
        assert_eq!(serde_json::to_string(&route).unwrap(), json);
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let route = serde_json::from_str::<Route>(r#"{"Name":"web","Ip":"10.0.0.1"}"#).unwrap();

        assert_eq!(route.target, "");
        assert_eq!(route.proto, Proto::Other(String::new()));
    }

    #[test]
    fn unknown_proto_survives_round_trip() {
        let route = serde_json::from_str::<Route>(r#"{"Proto":"sctp"}"#).unwrap();

        assert_eq!(route.proto, Proto::Other("sctp".to_owned()));
        assert!(serde_json::to_string(&route).unwrap().contains(r#""Proto":"sctp""#));
    }

    #[test]
    fn domain_lowers_and_appends_dot() {
        let route = Route {
            name: "Web.Svc.Cluster.Local".to_owned(),
            ..Default::default()
        };

        assert_eq!(route.domain(), "web.svc.cluster.local.");
    }

    #[test]
    fn table_preserves_route_order() {
        let json = r#"{"Name":"t","Routes":[{"Name":"b"},{"Name":"a"}]}"#;

        let table = serde_json::from_str::<Table>(json).unwrap();

        assert_eq!(table.routes[0].name, "b");
        assert_eq!(table.routes[1].name, "a");
    }
}
