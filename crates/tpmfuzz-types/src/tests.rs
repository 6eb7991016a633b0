use test_case::test_case;

use super::*;

#[test]
fn handle_splits_into_type_and_index() {
    let handle = Handle::from_type_and_index(HandleType::NvIndex, 0x50_0001);
    assert_eq!(handle.as_u32(), 0x0150_0001);
    assert_eq!(handle.handle_type(), Some(HandleType::NvIndex));
    assert_eq!(handle.index(), 0x50_0001);
}

#[test]
fn reserved_handles_are_permanent() {
    for handle in Handle::RESERVED {
        assert_eq!(handle.handle_type(), Some(HandleType::Permanent));
    }
}

#[test]
fn unknown_handle_tag_has_no_type() {
    assert_eq!(Handle::new(0x7700_0000).handle_type(), None);
}

#[test_case(ResponseCode::VALUE.with_parameter(3), ResponseCode::VALUE ; "parameter qualified")]
#[test_case(ResponseCode::HANDLE.with_handle(1), ResponseCode::HANDLE ; "handle qualified")]
#[test_case(ResponseCode::NV_DEFINED, ResponseCode::NV_DEFINED ; "format zero untouched")]
#[test_case(ResponseCode::LOCKOUT, ResponseCode::LOCKOUT ; "warning untouched")]
fn normalization_strips_location(raw: ResponseCode, expected: ResponseCode) {
    assert_eq!(raw.normalized(), expected);
}

#[test]
fn parameter_qualifier_sets_number_bits() {
    let rc = ResponseCode::SIZE.with_parameter(2);
    assert_eq!(rc.as_u32(), 0x095 | 0x040 | 0x200);
    assert!(rc.is_format_one());
}

#[test]
fn auth_and_lockout_classification() {
    assert!(ResponseCode::AUTH_FAIL.with_handle(1).is_auth_failure());
    assert!(ResponseCode::BAD_AUTH.is_auth_failure());
    assert!(!ResponseCode::VALUE.is_auth_failure());
    assert!(ResponseCode::LOCKOUT.is_lockout());
    assert!(!ResponseCode::SUCCESS.is_lockout());
}

#[test]
fn enum_spaces_are_sorted_and_fit_their_width() {
    let spaces = [
        EnumSpace::HashAlg,
        EnumSpace::SymAlg,
        EnumSpace::SymMode,
        EnumSpace::AsymScheme,
        EnumSpace::KdfScheme,
        EnumSpace::EccCurve,
        EnumSpace::StartupType,
        EnumSpace::YesNo,
        EnumSpace::Capability,
    ];
    for space in spaces {
        let values = space.values();
        assert!(values.windows(2).all(|w| w[0] < w[1]), "{space:?} not sorted");
        assert!(
            values
                .iter()
                .all(|v| u64::from(*v) <= space.width().max_value())
        );
    }
}

#[test]
fn struct_kind_indices_are_dense() {
    for (i, kind) in StructKind::ALL.iter().enumerate() {
        assert_eq!(kind.index(), i);
        assert_eq!(kind.template().kind, *kind);
    }
}

#[test]
fn union_selectors_round_trip() {
    for kind in StructKind::RsaParms.union_variants() {
        let selector = kind.selector().expect("union variant has selector");
        assert_eq!(
            StructKind::RsaParms.variant_for_selector(selector),
            Some(*kind)
        );
    }
    assert_eq!(StructKind::RsaParms.variant_for_selector(0x7777), None);
}

#[test]
fn optional_kinds_start_with_an_algorithm_enum() {
    for kind in StructKind::ALL.into_iter().filter(|k| k.is_optional()) {
        let template = kind.template();
        assert!(matches!(
            template.members.first().map(|m| &m.value),
            Some(Value::Enum { .. })
        ));
    }
}

#[test]
fn path_resolves_through_bodies_and_arrays() {
    let mut params = Structure::parameters(vec![
        Member::new("count", Value::Derived(Derived::Count)),
        Member::new(
            "selections",
            Value::array(
                StructKind::PcrSelection,
                vec![StructKind::PcrSelection.template()],
            ),
        ),
        Member::new("public", Value::sub(StructKind::Public.template())),
    ]);

    let item_path = MemberPath::root()
        .child(PathStep::Member(1))
        .child(PathStep::Item(0))
        .child(PathStep::Member(1));
    assert_eq!(params.at(&item_path).map(|m| m.name), Some("pcrSelect"));

    let nested_path = MemberPath::root()
        .child(PathStep::Member(2))
        .child(PathStep::Member(4))
        .child(PathStep::Member(2));
    let member = params.at_mut(&nested_path).expect("keyBits path");
    assert_eq!(member.name, "keyBits");
    member.value = Value::u16(1024);
    assert_eq!(
        params.at(&nested_path).and_then(|m| m.value.as_u64()),
        Some(1024)
    );
}

#[test]
fn path_into_absent_body_fails() {
    let params = Structure::parameters(vec![Member::new(
        "scheme",
        Value::absent(StructKind::AsymScheme),
    )]);
    let path = MemberPath::root()
        .child(PathStep::Member(0))
        .child(PathStep::Member(0));
    assert!(params.at(&path).is_none());
}

#[test]
fn path_display_is_compact() {
    let path = MemberPath::root()
        .child(PathStep::Member(1))
        .child(PathStep::Item(2))
        .child(PathStep::Member(0));
    assert_eq!(path.to_string(), "1[2].0");
    assert_eq!(MemberPath::root().to_string(), "<root>");
}

#[test]
fn identifiers_serialize_transparently() {
    let json = serde_json::to_string(&CommandCode::GET_RANDOM).expect("serialize");
    assert_eq!(json, "379");
}

mod properties {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn handle_recombines_from_its_parts(raw in any::<u32>()) {
            let handle = Handle::new(raw);
            let rebuilt = (u32::from(handle.type_tag()) << 24) | handle.index();
            prop_assert_eq!(rebuilt, raw);
        }

        #[test]
        fn normalization_is_idempotent(raw in any::<u32>()) {
            let once = ResponseCode::new(raw).normalized();
            prop_assert_eq!(once.normalized(), once);
        }
    }
}
