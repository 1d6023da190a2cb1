use meshca_identity::Identity;
use proptest::prelude::*;

fn segment() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-][a-zA-Z0-9._-]{0,30}"
}

fn trust_domain() -> impl Strategy<Value = String> {
    "[a-z0-9]([a-z0-9-]{0,10}\\.)?[a-z0-9]{1,10}"
}

proptest! {
    #[test]
    fn well_formed_ids_parse_to_their_components(
        td in trust_domain(),
        ns in segment(),
        sa in segment(),
    ) {
        let uri = format!("spiffe://{td}/ns/{ns}/sa/{sa}");
        let id = Identity::from_spiffe_uri(&uri).unwrap();
        prop_assert_eq!(id.trust_domain(), td.as_str());
        prop_assert_eq!(id.namespace(), ns.as_str());
        prop_assert_eq!(id.service_account(), sa.as_str());
        prop_assert_eq!(id.to_spiffe_uri(), uri);
    }

    #[test]
    fn extra_path_segments_are_rejected(
        td in trust_domain(),
        ns in segment(),
        sa in segment(),
        extra in segment(),
    ) {
        let uri = format!("spiffe://{td}/ns/{ns}/sa/{sa}/{extra}");
        prop_assert!(Identity::from_spiffe_uri(&uri).is_err());
    }

    #[test]
    fn segments_with_forbidden_characters_are_rejected(
        ns in segment(),
        bad in "[ :@%?#*+=]",
    ) {
        let uri = format!("spiffe://cluster.local/ns/{ns}{bad}/sa/web");
        prop_assert!(Identity::from_spiffe_uri(&uri).is_err());
    }

    #[test]
    fn parsing_never_panics(input in "\\PC{0,120}") {
        let _ = Identity::from_spiffe_uri(&input);
    }
}
