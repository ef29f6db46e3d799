#[cfg(test)]
mod tests {
    use meshkit_core::message::short_type_name;
    use meshkit_core::*;
    use std::collections::HashSet;

    fn identity(name: &str, uid: &str) -> NodeIdentity {
        NodeIdentity {
            name: name.into(),
            uid: uid.into(),
        }
    }

    // ── Identity / Peer tests ──────────────────────────────────

    #[test]
    fn test_peer_id_is_deterministic() {
        let a = Peer::new(identity("laptop", "uid-1"), None);
        let b = Peer::new(identity("laptop", "uid-1"), None);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 64);
        assert!(a.id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_peer_id_differs_per_identity() {
        let a = Peer::new(identity("laptop", "uid-1"), None);
        let b = Peer::new(identity("laptop", "uid-2"), None);
        let c = Peer::new(identity("phone", "uid-1"), None);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_peer_id_fields_are_length_prefixed() {
        // Same concatenation, different split between name and uid.
        let a = Peer::new(identity("ab", "c"), None);
        let b = Peer::new(identity("a", "bc"), None);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_generated_identities_are_unique() {
        let a = NodeIdentity::generate("same-name");
        let b = NodeIdentity::generate("same-name");
        assert_eq!(a.name, b.name);
        assert_ne!(a.uid, b.uid);
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_peer_equality_is_by_id() {
        let mut info = DiscoveryInfo::new();
        info.insert("room".into(), "kitchen".into());
        let a = Peer::new(identity("laptop", "uid-1"), None);
        let b = Peer::new(identity("laptop", "uid-1"), Some(info)).with_connected(true);

        assert_eq!(a, b);
        assert!(!a.same_state(&b));

        let set: HashSet<Peer> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_same_peer_list() {
        let a = Peer::new(identity("a", "1"), None);
        let b = Peer::new(identity("b", "2"), None);
        assert!(same_peer_list(&[a.clone(), b.clone()], &[a.clone(), b.clone()]));
        assert!(!same_peer_list(&[a.clone(), b.clone()], &[b.clone(), a.clone()]));
        assert!(!same_peer_list(&[a.clone()], &[a.clone().with_connected(true)]));
    }

    #[test]
    fn test_peer_serde_roundtrip() {
        let peer = Peer::new(identity("laptop", "uid-1"), None).with_connected(true);
        let json = serde_json::to_string(&peer).unwrap();
        let restored: Peer = serde_json::from_str(&json).unwrap();
        assert!(restored.same_state(&peer));
        assert_eq!(restored.name(), "laptop");
    }

    #[test]
    fn test_peer_display_shows_name_and_short_id() {
        let peer = Peer::new(identity("laptop", "uid-1"), None);
        let shown = peer.to_string();
        assert!(shown.starts_with("laptop ("));
        assert!(shown.contains(&peer.id()[..12]));
    }

    // ── Envelope tests ─────────────────────────────────────────

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::new("Note", Some(serde_json::json!({"text": "hi"})));
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "Note");
        assert_eq!(value["payload"]["text"], "hi");
    }

    #[test]
    fn test_envelope_null_payload_is_explicit() {
        let env = Envelope::new("Ping", None);
        let text = String::from_utf8(env.to_bytes().unwrap()).unwrap();
        assert!(text.contains("\"payload\":null"));
    }

    #[test]
    fn test_envelope_missing_payload_decodes_as_none() {
        let env = Envelope::from_bytes(br#"{"type":"Ping"}"#).unwrap();
        assert_eq!(env.type_tag, "Ping");
        assert!(env.payload.is_none());
    }

    #[test]
    fn test_envelope_without_type_fails() {
        let result = Envelope::from_bytes(br#"{"payload":1}"#);
        assert!(matches!(result, Err(MeshError::Serialization(_))));
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("chat::model::Note"), "Note");
        assert_eq!(short_type_name("Note"), "Note");
        assert_eq!(short_type_name("alloc::vec::Vec<chat::Note>"), "Vec<Note>");
        assert_eq!(
            short_type_name("std::collections::HashMap<alloc::string::String, u32>"),
            "HashMap<String, u32>"
        );
    }

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_error_display() {
        let err = MeshError::Encoding {
            type_tag: "Note".into(),
            reason: "no encoder registered".into(),
        };
        let s = err.to_string();
        assert!(s.contains("Note"));
        assert!(s.contains("no encoder registered"));
    }

    #[test]
    fn test_error_misuse_classification() {
        assert!(MeshError::NotALocalFile("https://x/y".into()).is_misuse());
        assert!(MeshError::ResourceConsumerAlreadyRegistered.is_misuse());
        assert!(!MeshError::SendFailed("boom".into()).is_misuse());
        assert!(!MeshError::InvitationTimedOut("peer".into()).is_misuse());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MeshError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    // ── Event Bus tests ────────────────────────────────────────

    #[test]
    fn test_event_bus_pub_sub() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let peer = Peer::new(identity("a", "1"), None);
        bus.publish(PeerEvent::Found(peer.clone()));

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, PeerEvent::Found(ref p) if *p == peer));
        assert_eq!(event.kind(), "found");
    }

    #[test]
    fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(PeerEvent::Lost(Peer::new(identity("a", "1"), None)));

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let peer = Peer::new(identity("a", "1"), None).with_connected(true);
        let json = serde_json::to_string(&PeerEvent::Connected(peer.clone())).unwrap();
        assert!(json.contains("\"kind\":\"connected\""));
        let restored: PeerEvent = serde_json::from_str(&json).unwrap();
        assert!(restored.peer().same_state(&peer));
    }

    #[test]
    fn test_encryption_preference_serde() {
        let json = serde_json::to_string(&EncryptionPreference::Required).unwrap();
        assert_eq!(json, "\"required\"");
        assert_eq!(EncryptionPreference::default(), EncryptionPreference::None);
    }
}
