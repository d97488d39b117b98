//! Protocol layer tests — envelope serialization, fault taxonomy, reserved names.

#[cfg(test)]
mod tests {
    use serde_json::json;
    use trellis_protocol::*;

    // ─────────────────────────────────────────────────────────────────────
    // Reserved names
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn underscore_names_are_restricted() {
        assert!(is_restricted("_secret"));
        assert!(is_restricted(" _secret"));
        assert!(is_restricted(GATEWAY_DOMAIN));
        assert!(!is_restricted("fruit"));
        assert!(!is_restricted("get_kinds"));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mesh envelopes
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn request_roundtrip() {
        let mut context_data = ContextData::new();
        context_data.insert("identity".into(), json!("ada"));

        let req = MeshRequest {
            id: 7,
            domain: "fruit".into(),
            origin: "abc123".into(),
            method: "getKinds".into(),
            payload: json!({"ripe": true}),
            context_data,
        };
        let wire = serde_json::to_string(&Envelope::Request(req)).unwrap();
        let parsed: Envelope = serde_json::from_str(&wire).unwrap();
        match parsed {
            Envelope::Request(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.method, "getKinds");
                assert_eq!(r.context_data["identity"], "ada");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn response_carries_shared_context() {
        let mut shared = ContextData::new();
        shared.insert("domain".into(), json!("fruit"));

        let resp = MeshResponse {
            id: 1,
            origin: "abc123".into(),
            payload: json!(["apple", "orange"]),
            stats: Stats { time: 1.5 },
            shared_context_data: shared,
        };
        let wire = serde_json::to_value(Envelope::Response(resp)).unwrap();
        assert_eq!(wire["type"], "response");
        assert_eq!(wire["sharedContextData"]["domain"], "fruit");
        assert_eq!(wire["stats"]["time"], 1.5);
    }

    #[test]
    fn stream_end_has_correlation_id() {
        let env = Envelope::StreamEnd {
            id: 42,
            origin: "abc".into(),
        };
        assert_eq!(env.id(), 42);
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["type"], "streamEnd");
        assert_eq!(wire["id"], 42);
    }

    #[test]
    fn fault_envelope_flattens_frame() {
        let env = Envelope::fault(3, "abc", &Fault::no_handler("nope"));
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["type"], "fault");
        assert_eq!(wire["kind"], "dispatch");
        assert_eq!(wire["message"], "No handler for method: nope");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fault taxonomy
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn no_handler_message_names_the_method() {
        let fault = Fault::no_handler("nope");
        assert!(fault.is_dispatch());
        assert_eq!(fault.to_string(), "No handler for method: nope");
    }

    #[test]
    fn inaccessible_message_names_domain_and_method() {
        let fault = Fault::inaccessible("fruit", "_noAccess");
        assert!(fault.is_dispatch());
        assert_eq!(fault.to_string(), "Inaccessible: fruit._noAccess");
    }

    #[test]
    fn dispatch_and_handler_kinds_survive_the_wire() {
        let dispatch: Fault = Fault::no_handler("x").frame().into();
        assert!(dispatch.is_dispatch());

        let handler: Fault = Fault::Handler("boom".into()).frame().into();
        assert!(handler.is_handler());
    }

    #[test]
    fn local_faults_cross_as_handler_faults() {
        let frame = Fault::Timeout(250).frame();
        assert_eq!(frame.kind, FaultKind::Handler);
        assert_eq!(frame.message, "response timed out after 250ms");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Gateway frames
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn client_request_wire_shape() {
        let wire = r#"{"type":"request","id":1,"domain":"fruit","method":"getKinds","payload":null}"#;
        let frame: ClientFrame = serde_json::from_str(wire).unwrap();
        let ClientFrame::Request { id, domain, method, .. } = frame;
        assert_eq!(id, 1);
        assert_eq!(domain, "fruit");
        assert_eq!(method, "getKinds");
    }

    #[test]
    fn notification_frame_shape() {
        let frame = ServerFrame::Notification {
            domain: "fruit".into(),
            method: "notify".into(),
            payload: json!({"type": "ripe"}),
        };
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["type"], "notification");
        assert_eq!(wire["method"], "notify");
        assert_eq!(wire["payload"]["type"], "ripe");
    }

    #[test]
    fn server_fault_frame_shape() {
        let frame = ServerFrame::fault(9, &Fault::inaccessible("_internal", "sweep"));
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["type"], "fault");
        assert_eq!(wire["id"], 9);
        assert_eq!(wire["kind"], "dispatch");
        assert_eq!(wire["message"], "Inaccessible: _internal.sweep");
    }

    #[test]
    fn notification_payload_omits_missing_domain() {
        let note = ApiNotification {
            recipient: Recipient { id: "conn-1".into() },
            domain: None,
            payload: json!({"type": "hello"}),
        };
        let wire = serde_json::to_value(&note).unwrap();
        assert!(wire.get("domain").is_none());
        assert_eq!(wire["recipient"]["id"], "conn-1");
    }
}
