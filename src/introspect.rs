//! Introspection documents.
//!
//! The same [`Node`] tree is produced by published objects (and written out
//! with [`Node::to_xml`]) and parsed from remote replies by proxies
//! ([`Node::from_xml`]). Elements this crate does not use, such as
//! `<annotation>` or `<property>`, are ignored when parsing.

use crate::{
    error::{Error, Result},
    names::INTROSPECT_DOCTYPE,
};
use quick_xml::{
    events::{BytesEnd, BytesStart, Event},
    Writer,
};
use serde::Deserialize;

pub const DIRECTION_IN: &str = "in";
pub const DIRECTION_OUT: &str = "out";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Node {
    #[serde(rename = "@name", default)]
    pub name: Option<String>,
    #[serde(rename = "interface", default)]
    pub interfaces: Vec<Interface>,
    #[serde(rename = "node", default)]
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Interface {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "method", default)]
    pub methods: Vec<Member>,
    #[serde(rename = "signal", default)]
    pub signals: Vec<Member>,
}

/// A method or a signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Member {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "arg", default)]
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Arg {
    #[serde(rename = "@name", default)]
    pub name: Option<String>,
    #[serde(rename = "@type", default)]
    pub ty: String,
    #[serde(rename = "@direction", default)]
    pub direction: Option<String>,
}

impl Arg {
    pub fn new(name: String, ty: &str, direction: Option<&str>) -> Self {
        Self {
            name: Some(name),
            ty: ty.to_owned(),
            direction: direction.map(str::to_owned),
        }
    }
}

impl Member {
    /// Concatenated types of the arguments explicitly marked `direction="in"`.
    pub fn in_signature(&self) -> String {
        self.args
            .iter()
            .filter(|arg| arg.direction.as_deref() == Some(DIRECTION_IN))
            .map(|arg| arg.ty.as_str())
            .collect()
    }
}

impl Node {
    /// Interface names in document order.
    pub fn interface_names(&self) -> Vec<&str> {
        self.interfaces.iter().map(|i| i.name.as_str()).collect()
    }

    pub fn from_xml(xml: &str) -> Result<Node> {
        quick_xml::de::from_str(xml).map_err(|e| Error::Introspection(e.to_string()))
    }

    /// The document, indented by two spaces and preceded by the standard
    /// doctype declaration.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        self.write(&mut writer)
            .map_err(|e| Error::Introspection(e.to_string()))?;
        let body = String::from_utf8(writer.into_inner())
            .map_err(|e| Error::Introspection(e.to_string()))?;
        Ok(format!("{INTROSPECT_DOCTYPE}{body}\n"))
    }

    fn write(&self, w: &mut Writer<Vec<u8>>) -> quick_xml::Result<()> {
        let mut start = BytesStart::new("node");
        if let Some(name) = &self.name {
            start.push_attribute(("name", name.as_str()));
        }
        w.write_event(Event::Start(start))?;
        for interface in &self.interfaces {
            let start = BytesStart::new("interface").with_attributes([("name", interface.name.as_str())]);
            w.write_event(Event::Start(start))?;
            for method in &interface.methods {
                write_member(w, "method", method)?;
            }
            for signal in &interface.signals {
                write_member(w, "signal", signal)?;
            }
            w.write_event(Event::End(BytesEnd::new("interface")))?;
        }
        for child in &self.children {
            child.write(w)?;
        }
        w.write_event(Event::End(BytesEnd::new("node")))
    }
}

fn write_member(w: &mut Writer<Vec<u8>>, tag: &str, member: &Member) -> quick_xml::Result<()> {
    let start = BytesStart::new(tag).with_attributes([("name", member.name.as_str())]);
    if member.args.is_empty() {
        return w.write_event(Event::Empty(start));
    }
    w.write_event(Event::Start(start))?;
    for arg in &member.args {
        let mut node = BytesStart::new("arg");
        if let Some(name) = &arg.name {
            node.push_attribute(("name", name.as_str()));
        }
        node.push_attribute(("type", arg.ty.as_str()));
        if let Some(direction) = &arg.direction {
            node.push_attribute(("direction", direction.as_str()));
        }
        w.write_event(Event::Empty(node))?;
    }
    w.write_event(Event::End(BytesEnd::new(tag)))
}
