//! End-to-end coverage of the pickler/unpickler pair against [`FakeHost`].

mod support;

use std::cell::RefCell;
use std::rc::Rc;

use pikala::model::{ArrayData, ArrayShape, Dimension, ObjectData, RuntimeValue};
use pikala::reflect::ReducedForm;
use pikala::wellknown::WellKnownType;
use pikala::{EngineOptions, Pickler, Unpickler};

use support::FakeHost;

fn roundtrip(host: &mut FakeHost, value: &RuntimeValue) -> RuntimeValue {
    let bytes = Pickler::new(host, EngineOptions::default()).pickle(value).unwrap();
    Unpickler::new(host, EngineOptions::default()).unpickle(&bytes).unwrap()
}

#[test]
fn boxed_primitive_roundtrips_through_the_object_slot() {
    let mut host = FakeHost::new();
    let back = roundtrip(&mut host, &RuntimeValue::I32(42));
    assert!(matches!(back, RuntimeValue::I32(42)));
}

#[test]
fn null_roundtrips() {
    let mut host = FakeHost::new();
    let back = roundtrip(&mut host, &RuntimeValue::Null);
    assert!(back.is_null());
}

#[test]
fn plain_object_roundtrips_its_fields() {
    let mut host = FakeHost::new();
    let string_ty = FakeHost::builtin(WellKnownType::String);
    let int_ty = FakeHost::builtin(WellKnownType::Int32);
    let point_ty = host.register_object_type("Point", false, vec![("label", string_ty), ("value", int_ty)]);

    let instance = RuntimeValue::Object(Rc::new(RefCell::new(ObjectData {
        type_handle: point_ty,
        fields: vec![RuntimeValue::String(Rc::from("origin")), RuntimeValue::I32(7)],
    })));

    let back = roundtrip(&mut host, &instance);
    match back {
        RuntimeValue::Object(cell) => {
            let data = cell.borrow();
            assert_eq!(data.type_handle, point_ty);
            assert!(matches!(&data.fields[0], RuntimeValue::String(s) if &**s == "origin"));
            assert!(matches!(data.fields[1], RuntimeValue::I32(7)));
        }
        other => panic!("expected an object, got {other:?}"),
    }
}

#[test]
fn shared_string_decodes_to_one_identity() {
    let mut host = FakeHost::new();
    let string_ty = FakeHost::builtin(WellKnownType::String);
    let pair_ty = host.register_object_type("Pair", false, vec![("a", string_ty), ("b", string_ty)]);

    let shared = RuntimeValue::String(Rc::from("shared"));
    let instance = RuntimeValue::Object(Rc::new(RefCell::new(ObjectData {
        type_handle: pair_ty,
        fields: vec![shared.clone(), shared],
    })));

    let back = roundtrip(&mut host, &instance);
    let RuntimeValue::Object(cell) = back else {
        panic!("expected an object");
    };
    let data = cell.borrow();
    let (RuntimeValue::String(a), RuntimeValue::String(b)) = (&data.fields[0], &data.fields[1]) else {
        panic!("expected two strings");
    };
    assert!(Rc::ptr_eq(a, b), "decoding must preserve the shared identity via the memo table");
}

#[test]
fn self_referential_object_roundtrips_the_cycle() {
    let mut host = FakeHost::new();
    let object_ty = FakeHost::builtin(WellKnownType::Object);
    let node_ty = host.register_object_type("Node", false, vec![("next", object_ty)]);

    let node = Rc::new(RefCell::new(ObjectData {
        type_handle: node_ty,
        fields: vec![RuntimeValue::Null],
    }));
    node.borrow_mut().fields[0] = RuntimeValue::Object(node.clone());
    let value = RuntimeValue::Object(node);

    let back = roundtrip(&mut host, &value);
    let RuntimeValue::Object(cell) = back else {
        panic!("expected an object");
    };
    let next = cell.borrow().fields[0].clone();
    match next {
        RuntimeValue::Object(inner) => assert!(Rc::ptr_eq(&inner, &cell), "decoded cycle must point back to itself"),
        other => panic!("expected the self-reference to survive, got {other:?}"),
    }
}

#[test]
fn vector_array_roundtrips_through_the_primitive_fast_path() {
    let mut host = FakeHost::new();
    let element_ty = FakeHost::builtin(WellKnownType::Int32);
    let array = RuntimeValue::Array(Rc::new(RefCell::new(ArrayData {
        element_type: element_ty,
        shape: ArrayShape::Vector,
        elements: vec![RuntimeValue::I32(1), RuntimeValue::I32(2), RuntimeValue::I32(3)],
    })));

    let back = roundtrip(&mut host, &array);
    let RuntimeValue::Array(cell) = back else {
        panic!("expected an array");
    };
    let data = cell.borrow();
    assert_eq!(data.vector_len(), 3);
    assert!(matches!(data.elements[1], RuntimeValue::I32(2)));
}

#[test]
fn bool_array_keeps_its_element_kind_through_the_fast_path() {
    // Regression coverage: the fast path used to forget which primitive kind
    // a fixed width came from, so a bool array decoded back as u8s.
    let mut host = FakeHost::new();
    let element_ty = FakeHost::builtin(WellKnownType::Boolean);
    let array = RuntimeValue::Array(Rc::new(RefCell::new(ArrayData {
        element_type: element_ty,
        shape: ArrayShape::Vector,
        elements: vec![RuntimeValue::Bool(true), RuntimeValue::Bool(false)],
    })));

    let back = roundtrip(&mut host, &array);
    let RuntimeValue::Array(cell) = back else {
        panic!("expected an array");
    };
    let data = cell.borrow();
    assert!(matches!(data.elements[0], RuntimeValue::Bool(true)));
    assert!(matches!(data.elements[1], RuntimeValue::Bool(false)));
}

#[test]
fn multi_dim_array_preserves_shape_and_lower_bounds() {
    let mut host = FakeHost::new();
    let element_ty = FakeHost::builtin(WellKnownType::Double);
    let shape = ArrayShape::MultiDim(vec![
        Dimension { length: 2, lower_bound: 0 },
        Dimension { length: 3, lower_bound: -1 },
    ]);
    let array = RuntimeValue::Array(Rc::new(RefCell::new(ArrayData {
        element_type: element_ty,
        shape: shape.clone(),
        elements: (0..6).map(|i| RuntimeValue::F64(i as f64)).collect(),
    })));

    let back = roundtrip(&mut host, &array);
    let RuntimeValue::Array(cell) = back else {
        panic!("expected an array");
    };
    let data = cell.borrow();
    match &data.shape {
        ArrayShape::MultiDim(dims) => {
            assert_eq!(dims[0].length, 2);
            assert_eq!(dims[1].lower_bound, -1);
        }
        other => panic!("expected a multi-dim shape, got {other:?}"),
    }
    assert_eq!(data.elements.len(), 6);
}

#[test]
fn enum_value_carries_its_type_handle_through_decode() {
    let mut host = FakeHost::new();
    let color_ty = host.register_enum_type("Color", WellKnownType::Int32);

    let value = RuntimeValue::Enum { type_handle: color_ty, value: 2 };
    let back = roundtrip(&mut host, &value);
    match back {
        RuntimeValue::Enum { type_handle, value } => {
            assert_eq!(type_handle, color_ty);
            assert_eq!(value, 2);
        }
        other => panic!("expected an enum, got {other:?}"),
    }
}

#[test]
fn reducer_constructed_object_roundtrips_through_its_constructor_args() {
    let mut host = FakeHost::new();
    let money_ty = host.register_reducer(
        "Money",
        |value| match value {
            RuntimeValue::Object(cell) => {
                let cents = cell.borrow().fields.first().cloned()?;
                Some(ReducedForm {
                    constructor: pikala::reflect::MethodHandle(1),
                    target: None,
                    args: vec![cents],
                })
            }
            _ => None,
        },
        |reduced| {
            if reduced.constructor.id() != 1 {
                return Err(pikala::error::Error::Construction("unrecognized constructor".into()));
            }
            Ok(RuntimeValue::Object(Rc::new(RefCell::new(ObjectData {
                type_handle: pikala::reflect::TypeHandle(0),
                fields: reduced.args.clone(),
            }))))
        },
    );

    let instance = RuntimeValue::Object(Rc::new(RefCell::new(ObjectData {
        type_handle: money_ty,
        fields: vec![RuntimeValue::I64(500)],
    })));

    let back = roundtrip(&mut host, &instance);
    match back {
        RuntimeValue::Object(cell) => {
            assert!(matches!(cell.borrow().fields[0], RuntimeValue::I64(500)));
        }
        other => panic!("expected a reconstructed object, got {other:?}"),
    }
}

#[test]
fn rejects_a_stream_with_bad_magic() {
    let mut host = FakeHost::new();
    let err = Unpickler::new(&mut host, EngineOptions::default())
        .unpickle(&[0, 0, 0, 0, 1, 0, 0, 0])
        .unwrap_err();
    assert!(matches!(err, pikala::Error::InvalidData(_)));
}

#[test]
fn type_info_is_derived_once_per_stream() {
    // Encoding the same user type twice in one pickle call must reuse the
    // same cached `TypeInfo` rather than re-deriving it (spec §3's
    // within-one-stream type-info stability invariant). We can't observe
    // the cache directly from outside the crate, but a tuple holding two
    // instances of the same type is a black-box proxy: if derivation were
    // unstable the second instance's fields could be written with a
    // different shape and the round trip would fail.
    let mut host = FakeHost::new();
    let int_ty = FakeHost::builtin(WellKnownType::Int32);
    let box_ty = host.register_object_type("Box", false, vec![("value", int_ty)]);

    let first = RuntimeValue::Object(Rc::new(RefCell::new(ObjectData {
        type_handle: box_ty,
        fields: vec![RuntimeValue::I32(1)],
    })));
    let second = RuntimeValue::Object(Rc::new(RefCell::new(ObjectData {
        type_handle: box_ty,
        fields: vec![RuntimeValue::I32(2)],
    })));
    let pair = RuntimeValue::RefTuple(Rc::new(RefCell::new(vec![first, second])));

    let back = roundtrip(&mut host, &pair);
    let RuntimeValue::RefTuple(cell) = back else {
        panic!("expected a ref tuple");
    };
    let elements = cell.borrow();
    let values: Vec<_> = elements
        .iter()
        .map(|v| match v {
            RuntimeValue::Object(cell) => match cell.borrow().fields[0] {
                RuntimeValue::I32(n) => n,
                _ => panic!("expected an int field"),
            },
            other => panic!("expected an object, got {other:?}"),
        })
        .collect();
    assert_eq!(values, vec![1, 2]);
}
