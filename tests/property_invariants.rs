// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property-based tests for the dispatch-engine invariants that span crates:
//! routing-table bijection, body and correlation round-trips, header lifting,
//! and URI-rewrite behavior.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;
use vxp_dispatch::backend::SupportedMethod;
use vxp_dispatch::publisher::{self, ReplyProperties};
use vxp_dispatch::{ExtensionRuntime, RoutingTable};
use vxp_error::ErrorKind;
use vxp_extension::{
    BackendSpec, ExchangeSpec, ExchangeType, ExtensionDescriptor, QueueSpec, UriRewrite,
};
use vxp_protocol::{ExtensionRequest, ForgedHeaders, ReplyBody, ReplyEnvelope, RequestContext};

// ---------------------------------------------------------------------------
// Strategies & helpers
// ---------------------------------------------------------------------------

fn descriptor(name: &str, routing_key: &str, rewrite: Option<UriRewrite>) -> ExtensionDescriptor {
    ExtensionDescriptor {
        name: name.to_string(),
        routing_key: routing_key.to_string(),
        declare: true,
        exchange: ExchangeSpec {
            name: "vcdext".to_string(),
            kind: ExchangeType::Topic,
            durable: true,
        },
        queue: QueueSpec {
            name: format!("{name}-q"),
            message_ttl_ms: 30_000,
        },
        backend: BackendSpec {
            endpoint: "https://backend.example.net/api".to_string(),
            auth: None,
            ssl_verify: true,
            timeout: Duration::from_secs(600),
            uri_rewrite: rewrite,
        },
    }
}

fn arb_routing_keys() -> impl Strategy<Value = Vec<String>> {
    prop::collection::hash_set("[a-z][a-z0-9.]{0,15}", 1..8)
        .prop_map(|set| set.into_iter().collect())
}

fn arb_uuid_like() -> impl Strategy<Value = String> {
    "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"
}

fn arb_path_piece() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_]{1,12}"
}

// ---------------------------------------------------------------------------
// Routing table bijection and duplicate rejection
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn routing_table_is_bijective(keys in arb_routing_keys()) {
        let runtimes: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                ExtensionRuntime::new(descriptor(&format!("ext{i}"), key, None)).unwrap()
            })
            .collect();
        let table = RoutingTable::build(runtimes).unwrap();

        prop_assert_eq!(table.len(), keys.len());
        for (i, key) in keys.iter().enumerate() {
            let found = table.get(key).expect("registered key must resolve");
            prop_assert_eq!(&found.descriptor().name, &format!("ext{i}"));
        }
    }

    #[test]
    fn duplicate_routing_key_rejected(key in "[a-z.]{1,12}") {
        let runtimes = vec![
            ExtensionRuntime::new(descriptor("one", &key, None)).unwrap(),
            ExtensionRuntime::new(descriptor("two", &key, None)).unwrap(),
        ];
        let err = RoutingTable::build(runtimes).unwrap_err();
        prop_assert_eq!(err.kind, ErrorKind::ConfigDuplicateKey);
    }
}

// ---------------------------------------------------------------------------
// Method round-trip
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn supported_methods_roundtrip_case_insensitively(
        idx in 0usize..7,
        flips in prop::collection::vec(any::<bool>(), 7),
    ) {
        let canonical = ["get", "post", "put", "delete", "patch", "head", "options"][idx];
        // Randomize the casing the requester used.
        let mixed: String = canonical
            .chars()
            .zip(flips.iter().cycle())
            .map(|(c, upper)| if *upper { c.to_ascii_uppercase() } else { c })
            .collect();

        let method = SupportedMethod::parse(&mixed.to_ascii_lowercase()).expect("supported");
        prop_assert_eq!(method.as_reqwest().as_str().to_ascii_lowercase(), canonical);
    }
}

// ---------------------------------------------------------------------------
// Body round-trip and Content-Length fidelity
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn request_body_decodes_to_original_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut request = ExtensionRequest::default();
        request.body = BASE64.encode(&bytes);
        prop_assert_eq!(request.body_bytes().unwrap(), bytes);
    }

    #[test]
    fn reply_body_roundtrips_and_reports_decoded_length(
        bytes in prop::collection::vec(any::<u8>(), 0..512),
        status in 100u16..600,
    ) {
        let body = ReplyBody::Bytes(bytes.clone());
        let envelope = ReplyEnvelope::build(Some("id".into()), &body, status, None);
        prop_assert_eq!(envelope.headers.content_length, bytes.len() as u64);
        prop_assert_eq!(BASE64.decode(&envelope.body).unwrap(), bytes);
        prop_assert_eq!(envelope.status_code, status);
    }

    #[test]
    fn text_reply_length_counts_utf8_bytes(text in "\\PC{0,64}") {
        let body = ReplyBody::Text(text.clone());
        let envelope = ReplyEnvelope::build(None, &body, 200, None);
        prop_assert_eq!(envelope.headers.content_length, text.len() as u64);
    }
}

// ---------------------------------------------------------------------------
// Correlation echo
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn reply_echoes_correlation_and_address(
        correlation in "[A-Za-z0-9-]{1,32}",
        reply_to in "[a-z0-9.]{1,24}",
        exchange in "[a-z0-9-]{1,24}",
    ) {
        let props = ReplyProperties {
            extension: "ext".to_string(),
            id: "id".to_string(),
            accept: None,
            correlation_id: Some(correlation.clone()),
            reply_to: Some(reply_to.clone()),
            reply_to_exchange: Some(exchange.clone()),
            status_code: 200,
            content_type: None,
        };
        let prepared = publisher::prepare(&ReplyBody::Text("ok".into()), &props).unwrap();
        prop_assert_eq!(prepared.routing_key, reply_to);
        prop_assert_eq!(prepared.exchange, exchange);
        let echoed = prepared
            .properties
            .correlation_id()
            .as_ref()
            .unwrap()
            .as_str()
            .to_string();
        prop_assert_eq!(echoed, correlation);
    }
}

// ---------------------------------------------------------------------------
// Header lifting
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn context_lifts_into_headers(
        org in arb_uuid_like(),
        user in arb_uuid_like(),
        rights in prop::collection::vec("[A-Za-z: ]{1,16}", 0..5),
    ) {
        let request = ExtensionRequest::default();
        let context = RequestContext {
            org: format!("urn:vcloud:org:{org}"),
            user: format!("urn:vcloud:user:{user}"),
            rights: rights.clone(),
        };
        let forged = ForgedHeaders::forge(&request, &context).unwrap();
        prop_assert_eq!(forged.get("org_id").unwrap(), org);
        prop_assert_eq!(forged.get("user_id").unwrap(), user);
        prop_assert_eq!(
            forged.get("user_rights").unwrap(),
            serde_json::to_string(&rights).unwrap()
        );
    }
}

// ---------------------------------------------------------------------------
// URI rewrite
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn rewrite_is_noop_when_pattern_absent(piece in arb_path_piece()) {
        let with = descriptor("x", "k", Some(UriRewrite {
            pattern: "/zzz/".to_string(),
            replacement: "/yyy/".to_string(),
        }));
        let without = descriptor("x", "k", None);
        let uri = format!("/{piece}/items");
        prop_assert_eq!(
            with.backend_url(&uri, None).unwrap(),
            without.backend_url(&uri, None).unwrap()
        );
    }

    #[test]
    fn rewrite_removes_every_occurrence(
        piece in arb_path_piece(),
        repeats in 1usize..4,
    ) {
        let with = descriptor("x", "k", Some(UriRewrite {
            pattern: "/v/".to_string(),
            replacement: "/v2/".to_string(),
        }));
        let uri = format!("{}{piece}", "/v/".repeat(repeats));
        let url = with.backend_url(&uri, None).unwrap();
        prop_assert!(!url.contains("/v/"), "rewritten URL still contains the pattern: {}", url);
    }
}

// ---------------------------------------------------------------------------
// Determinism of registration order
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn registration_order_is_stable(keys in arb_routing_keys()) {
        let build = || {
            let runtimes: Vec<_> = keys
                .iter()
                .enumerate()
                .map(|(i, key)| {
                    ExtensionRuntime::new(descriptor(&format!("ext{i}"), key, None)).unwrap()
                })
                .collect();
            RoutingTable::build(runtimes).unwrap()
        };
        let first: Vec<_> = build().in_order().map(|r| r.descriptor().name.clone()).collect();
        let second: Vec<_> = build().in_order().map(|r| r.descriptor().name.clone()).collect();
        prop_assert_eq!(first.clone(), second);

        let unique: HashSet<_> = first.iter().collect();
        prop_assert_eq!(unique.len(), keys.len());
    }
}
