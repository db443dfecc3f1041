//! Sparkplug-B topic grammar
//!
//! `spBv1.0/{group}/{message_kind}/{edge_node}[/{device}]`. Device-scoped
//! kinds (D*) require the device segment; node-scoped kinds must not carry
//! one.

pub const NAMESPACE: &str = "spBv1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    NBirth,
    NData,
    NDeath,
    NCmd,
    DBirth,
    DData,
    DDeath,
    DCmd,
}

impl MessageKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NBIRTH" => Some(Self::NBirth),
            "NDATA" => Some(Self::NData),
            "NDEATH" => Some(Self::NDeath),
            "NCMD" => Some(Self::NCmd),
            "DBIRTH" => Some(Self::DBirth),
            "DDATA" => Some(Self::DData),
            "DDEATH" => Some(Self::DDeath),
            "DCMD" => Some(Self::DCmd),
            _ => None,
        }
    }

    pub fn is_device_scoped(&self) -> bool {
        matches!(self, Self::DBirth | Self::DData | Self::DDeath | Self::DCmd)
    }

    pub fn is_birth(&self) -> bool {
        matches!(self, Self::NBirth | Self::DBirth)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::NData | Self::DData)
    }
}

/// A parsed Sparkplug topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparkplugTopic {
    pub group: String,
    pub kind: MessageKind,
    pub node: String,
    pub device: Option<String>,
}

impl SparkplugTopic {
    pub fn parse(topic: &str) -> Option<Self> {
        let mut parts = topic.split('/');
        if parts.next()? != NAMESPACE {
            return None;
        }
        let group = parts.next()?;
        let kind = MessageKind::parse(parts.next()?)?;
        let node = parts.next()?;
        let device = parts.next();
        if parts.next().is_some() {
            return None;
        }
        if group.is_empty() || node.is_empty() {
            return None;
        }
        match (kind.is_device_scoped(), device) {
            (true, Some(d)) if !d.is_empty() => Some(Self {
                group: group.to_string(),
                kind,
                node: node.to_string(),
                device: Some(d.to_string()),
            }),
            (false, None) => Some(Self {
                group: group.to_string(),
                kind,
                node: node.to_string(),
                device: None,
            }),
            _ => None,
        }
    }
}

/// Topic for a node-level command.
pub fn ncmd_topic(group: &str, node: &str) -> String {
    format!("{NAMESPACE}/{group}/NCMD/{node}")
}

/// Topic for a device-level command.
pub fn dcmd_topic(group: &str, node: &str, device: &str) -> String {
    format!("{NAMESPACE}/{group}/DCMD/{node}/{device}")
}

/// The four subscription filters the ingress consumes, each optionally
/// wrapped in an MQTT 5 shared-subscription group.
pub fn subscription_filters(shared_group: Option<&str>) -> Vec<String> {
    let filters = [
        format!("{NAMESPACE}/+/NBIRTH/+"),
        format!("{NAMESPACE}/+/NDATA/+"),
        format!("{NAMESPACE}/+/DBIRTH/+/+"),
        format!("{NAMESPACE}/+/DDATA/+/+"),
    ];
    match shared_group {
        Some(group) => filters
            .into_iter()
            .map(|f| format!("$share/{group}/{f}"))
            .collect(),
        None => filters.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_scoped_topics() {
        let t = SparkplugTopic::parse("spBv1.0/G1/NDATA/N1").unwrap();
        assert_eq!(t.group, "G1");
        assert_eq!(t.kind, MessageKind::NData);
        assert_eq!(t.node, "N1");
        assert_eq!(t.device, None);
        assert!(t.kind.is_data());
    }

    #[test]
    fn parses_device_scoped_topics() {
        let t = SparkplugTopic::parse("spBv1.0/G1/DBIRTH/N1/D1").unwrap();
        assert_eq!(t.kind, MessageKind::DBirth);
        assert_eq!(t.device.as_deref(), Some("D1"));
        assert!(t.kind.is_birth());
    }

    #[test]
    fn rejects_wrong_namespace_and_shape() {
        assert!(SparkplugTopic::parse("spAv1.0/G1/NDATA/N1").is_none());
        assert!(SparkplugTopic::parse("spBv1.0/G1/NOPE/N1").is_none());
        // device segment on a node-scoped kind
        assert!(SparkplugTopic::parse("spBv1.0/G1/NDATA/N1/D1").is_none());
        // missing device on a device-scoped kind
        assert!(SparkplugTopic::parse("spBv1.0/G1/DDATA/N1").is_none());
        // trailing segments
        assert!(SparkplugTopic::parse("spBv1.0/G1/DDATA/N1/D1/extra").is_none());
        // empty segments
        assert!(SparkplugTopic::parse("spBv1.0//NDATA/N1").is_none());
    }

    #[test]
    fn command_topics() {
        assert_eq!(ncmd_topic("G1", "N1"), "spBv1.0/G1/NCMD/N1");
        assert_eq!(dcmd_topic("G1", "N1", "D1"), "spBv1.0/G1/DCMD/N1/D1");
    }

    #[test]
    fn subscription_filters_cover_the_four_classes() {
        let filters = subscription_filters(None);
        assert_eq!(filters.len(), 4);
        assert!(filters.contains(&"spBv1.0/+/NBIRTH/+".to_string()));
        assert!(filters.contains(&"spBv1.0/+/DDATA/+/+".to_string()));
    }

    #[test]
    fn shared_group_prefixes_every_filter() {
        let filters = subscription_filters(Some("mantle"));
        assert!(filters.iter().all(|f| f.starts_with("$share/mantle/spBv1.0/")));
    }
}
