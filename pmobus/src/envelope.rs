//! XML envelopes and the verbs they carry.

use std::collections::HashMap;

use xmltree::{Element, XMLNode};

use pmoutils::xml::{child_elements, element_to_string, parse_str};

use crate::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Reply,
}

/// One message on the bus: a `<request>` or `<reply>` wrapper holding a
/// single verb element.
///
/// The one-off `register` verb travels bare (no wrapper): it is the
/// only message sent before a token exists.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub token: Option<String>,
    body: Element,
}

impl Envelope {
    pub fn request(body: Element, token: Option<&str>) -> Envelope {
        Envelope {
            kind: EnvelopeKind::Request,
            token: token.map(str::to_string),
            body,
        }
    }

    pub fn reply(body: Element, token: Option<&str>) -> Envelope {
        Envelope {
            kind: EnvelopeKind::Reply,
            token: token.map(str::to_string),
            body,
        }
    }

    /// The tag of the verb element, e.g. `"ping"`.
    pub fn verb(&self) -> &str {
        &self.body.name
    }

    pub fn body(&self) -> &Element {
        &self.body
    }

    pub fn into_body(self) -> Element {
        self.body
    }

    pub fn to_element(&self) -> Element {
        if self.body.name == "register" {
            return self.body.clone();
        }
        let mut root = Element::new(match self.kind {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Reply => "reply",
        });
        if let Some(token) = &self.token {
            root.attributes.insert("token".to_string(), token.clone());
        }
        root.children.push(XMLNode::Element(self.body.clone()));
        root
    }

    pub fn to_xml(&self) -> String {
        element_to_string(&self.to_element())
    }

    pub fn parse(xml: &str) -> Result<Envelope, BusError> {
        let root = parse_str(xml)?;
        Envelope::from_element(root)
    }

    pub fn from_element(root: Element) -> Result<Envelope, BusError> {
        if root.name == "register" {
            let token = root.attributes.get("token").cloned();
            return Ok(Envelope {
                kind: EnvelopeKind::Request,
                token,
                body: root,
            });
        }

        let kind = match root.name.as_str() {
            "request" => EnvelopeKind::Request,
            "reply" => EnvelopeKind::Reply,
            other => {
                return Err(BusError::InvalidEnvelope(format!(
                    "unexpected root element '{other}'"
                )));
            }
        };
        let token = root.attributes.get("token").cloned();
        let mut bodies: Vec<Element> = child_elements(&root).cloned().collect();
        if bodies.len() != 1 {
            return Err(BusError::InvalidEnvelope(format!(
                "expected exactly one verb element, found {}",
                bodies.len()
            )));
        }
        Ok(Envelope {
            kind,
            token,
            body: bodies.remove(0),
        })
    }
}

/// Constructors and accessors for the verb elements.
pub mod verbs {
    use super::*;

    pub fn ping() -> Element {
        Element::new("ping")
    }

    pub fn pong() -> Element {
        Element::new("pong")
    }

    pub fn register(token: &str) -> Element {
        let mut elem = Element::new("register");
        elem.attributes.insert("token".into(), token.into());
        elem
    }

    /// A `params` element carrying name/value `<param>` children.
    pub fn params(entries: &HashMap<String, String>) -> Element {
        let mut root = Element::new("params");
        for (name, value) in entries {
            let mut param = Element::new("param");
            param.attributes.insert("name".into(), name.clone());
            param.attributes.insert("value".into(), value.clone());
            root.children.push(XMLNode::Element(param));
        }
        root
    }

    /// Read a `params` element back into a map. Any non-`param` child
    /// is an error.
    pub fn params_map(elem: &Element) -> Result<HashMap<String, String>, BusError> {
        let mut entries = HashMap::new();
        for param in child_elements(elem) {
            if param.name != "param" {
                return Err(BusError::InvalidEnvelope(
                    "params contained a non-param tag".into(),
                ));
            }
            let name = param.attributes.get("name").cloned().ok_or_else(|| {
                BusError::InvalidEnvelope("param without a name attribute".into())
            })?;
            let value = param.attributes.get("value").cloned().unwrap_or_default();
            entries.insert(name, value);
        }
        Ok(entries)
    }

    pub fn subscription_update(uri: &str, body: Element) -> Element {
        let mut elem = Element::new("subscription_update");
        elem.attributes.insert("uri".into(), uri.into());
        elem.children.push(XMLNode::Element(body));
        elem
    }

    pub fn sensor_update(event: &str, body: Element) -> Element {
        let mut elem = Element::new("sensor_update");
        elem.attributes.insert("event".into(), event.into());
        elem.children.push(XMLNode::Element(body));
        elem
    }

    pub fn finished_loading(renderer_id: &str) -> Element {
        let mut elem = Element::new("finished_loading");
        elem.attributes.insert("id".into(), renderer_id.into());
        elem
    }

    pub fn preparation_failed(renderer_id: &str) -> Element {
        let mut elem = Element::new("preparation_failed");
        elem.attributes.insert("id".into(), renderer_id.into());
        elem
    }

    pub fn display_on(until_unix: i64) -> Element {
        let mut elem = Element::new("display_on");
        elem.attributes.insert("until".into(), until_unix.to_string());
        elem
    }

    pub fn error(message: Option<&str>) -> Element {
        let mut elem = Element::new("error");
        if let Some(message) = message {
            elem.attributes.insert("message".into(), message.into());
        }
        elem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let env = Envelope::request(verbs::ping(), Some("tok-1"));
        let parsed = Envelope::parse(&env.to_xml()).unwrap();
        assert_eq!(parsed.kind, EnvelopeKind::Request);
        assert_eq!(parsed.token.as_deref(), Some("tok-1"));
        assert_eq!(parsed.verb(), "ping");
    }

    #[test]
    fn register_travels_bare() {
        let env = Envelope::request(verbs::register("one-off"), None);
        let xml = env.to_xml();
        assert!(xml.starts_with("<register"));
        let parsed = Envelope::parse(&xml).unwrap();
        assert_eq!(parsed.verb(), "register");
        assert_eq!(parsed.token.as_deref(), Some("one-off"));
    }

    #[test]
    fn params_roundtrip() {
        let mut entries = HashMap::new();
        entries.insert("token".to_string(), "fresh".to_string());
        entries.insert("uri".to_string(), "file:///tmp/root.xml".to_string());
        let env = Envelope::reply(verbs::params(&entries), None);
        let parsed = Envelope::parse(&env.to_xml()).unwrap();
        assert_eq!(parsed.verb(), "params");
        assert_eq!(verbs::params_map(parsed.body()).unwrap(), entries);
    }

    #[test]
    fn rejects_multiple_verbs() {
        let xml = "<request token='t'><ping/><pong/></request>";
        assert!(Envelope::parse(xml).is_err());
    }

    #[test]
    fn subscription_update_carries_uri_and_body() {
        let body = pmoutils::xml::parse_str("<content-set type='inline'/>").unwrap();
        let env = Envelope::request(verbs::subscription_update("file:///r.xml", body), Some("t"));
        let parsed = Envelope::parse(&env.to_xml()).unwrap();
        assert_eq!(parsed.verb(), "subscription_update");
        assert_eq!(
            parsed.body().attributes.get("uri").map(String::as_str),
            Some("file:///r.xml")
        );
        assert!(parsed.body().get_child("content-set").is_some());
    }
}
