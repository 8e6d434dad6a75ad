use super::*;

use std::rc::Rc;
use std::str::FromStr;

use num_bigint::BigInt;
use rand::Rng;
use rust_decimal::Decimal;

use crate::codec::{cached_codecs, reset_codecs, Datatype};
use crate::io::ContainerError;
use crate::types::{PrimitiveKind, RecordType, StorageTraits};

fn point() -> RecordType {
    RecordType::immutable("geo::Point")
        .field("x", PrimitiveKind::Int64)
        .field("y", PrimitiveKind::Int64)
}

fn node() -> RecordType {
    RecordType::mutable("geo::Node")
        .field("value", PrimitiveKind::Int64)
        .field("next", SourceType::Any)
}

fn cell() -> RecordType {
    RecordType::mutable("geo::Cell").field("v", PrimitiveKind::Int64)
}

fn store_with(records: Vec<RecordType>) -> (Stowage<MemoryContainer>, Vec<SourceType>) {
    let mut types = TypeTable::new();
    let registered = records
        .into_iter()
        .map(|r| types.register_record(r))
        .collect();
    let store = Stowage::in_memory(types, InlinePolicy::default()).expect("creates store");
    (store, registered)
}

#[test]
fn it_round_trips_points() {
    let (mut store, types) = store_with(vec![point()]);
    let point = &types[0];
    let handle = store.value_datatype(point, true).expect("commits");
    assert_eq!(handle.datatype.size(), 16);
    let offsets: Vec<usize> = handle.datatype.members().iter().map(|m| m.offset).collect();
    assert_eq!(offsets, vec![0, 8]);

    let value = Value::record(point, vec![Some(Value::Int64(3)), Some(Value::Int64(4))])
        .expect("valid record");
    store.write("p", &value).expect("writes");
    let read = store.read("p").expect("reads").expect("bound");
    assert_eq!(read, value);
    let record = read.as_record().expect("record");
    assert_eq!(record.get_named("x"), Some(Value::Int64(3)));
    assert_eq!(record.get_named("y"), Some(Value::Int64(4)));
}

#[test]
fn it_keeps_unassigned_references_unassigned() {
    let (mut store, types) = store_with(vec![node()]);
    let node = &types[0];
    let value = Value::record(node, vec![Some(Value::Int64(1)), None]).expect("valid record");
    let reference = store.write("n", &value).expect("writes");
    let object = store.container().read_object(reference).expect("stored");
    assert_eq!(&object.data[8..16], &[0; 8]);

    let read = store.read("n").expect("reads").expect("bound");
    let record = read.as_record().expect("record");
    assert_eq!(record.get_named("value"), Some(Value::Int64(1)));
    assert_eq!(record.get_named("next"), None);
}

#[test]
fn it_round_trips_strings() {
    let (mut store, _) = store_with(vec![]);
    store.write("greeting", &Value::string("hello")).expect("writes");
    let read = store.read("greeting").expect("reads").expect("bound");
    assert_eq!(read, Value::string("hello"));

    let mut session = WriteSession::new();
    let mut buf = vec![0; 16];
    store
        .encode(&mut buf, &Value::string("hello"), &mut session)
        .expect("encodes");
    let heap = session.into_heap();
    let decoded = store
        .decode(&SourceType::ByteString, &buf, &heap)
        .expect("decodes");
    drop(heap);
    assert_eq!(decoded, Value::string("hello"));
}

#[test_log::test(tokio::test)]
async fn it_reads_unknown_types_by_reconstruction() {
    let path = "reconstruct_widget.stw";
    let mut types = TypeTable::new();
    let widget = types.register_record(
        RecordType::immutable("geo::Widget").field("count", PrimitiveKind::Int64),
    );
    let mut store = Stowage::try_new(path, types, InlinePolicy::default())
        .await
        .expect("creates store");
    let value = Value::record(&widget, vec![Some(Value::Int64(42))]).expect("valid record");
    store.write("w", &value).expect("writes");
    store
        .write("kind", &Value::Type(widget.clone()))
        .expect("writes");
    store.flush_to_disk().await.expect("flushes");
    drop(store);

    // A process which has never heard of a Widget
    let mut store = Stowage::try_open(path, TypeTable::new(), InlinePolicy::default())
        .await
        .expect("opens store");
    let read = store.read("w").expect("reads").expect("bound");
    let record = read.as_record().expect("record");
    assert_eq!(record.record_type().name(), "geo::Widget");
    assert!(record.record_type().is_reconstructed());
    assert_eq!(record.get_named("count"), Some(Value::Int64(42)));
    assert!(store.types().get_reconstructed("geo::Widget").is_some());

    let kind = store.read("kind").expect("reads").expect("bound");
    let Value::Type(ty) = kind else {
        panic!("not a type: {kind}");
    };
    assert_eq!(ty.qualified_name(), "geo::Widget");

    // Reconstructed types are read-only
    let err = store.write("again", &read).expect_err("read-only");
    assert!(matches!(
        err.downcast_ref::<CodecError>(),
        Some(CodecError::UnsupportedType(_))
    ));
    drop(store);
    std::fs::remove_file(path).expect("cleanup");
}

#[test]
fn it_marks_and_round_trips_empty_types() {
    let (mut store, types) = store_with(vec![RecordType::immutable("geo::Marker")]);
    let marker = &types[0];
    let value = Value::record(marker, vec![]).expect("valid record");
    store.write("m", &value).expect("writes");
    let committed = store.committed().expect("lists");
    assert_eq!(committed.len(), 1);
    assert!(committed[0].empty);
    assert_eq!(committed[0].datatype, Datatype::create_opaque(1));
    assert_eq!(committed[0].name.as_deref(), Some("geo::Marker"));

    let read = store.read("m").expect("reads").expect("bound");
    assert_eq!(read, value);
    let decoded = store.decode(marker, &[], &[]).expect("decodes without reading");
    assert!(decoded.source_type().is_empty());
}

#[test]
fn it_preserves_sharing() {
    let mut types = TypeTable::new();
    let cell = types.register_record(cell());
    let pair = types.register_record(
        RecordType::immutable("geo::Pair")
            .field("a", cell.clone())
            .field("b", cell.clone()),
    );
    let mut store = Stowage::in_memory(types, InlinePolicy::default()).expect("creates store");
    let shared = Value::record(&cell, vec![Some(Value::Int64(5))]).expect("valid record");
    let value = Value::record(&pair, vec![Some(shared.clone()), Some(shared)])
        .expect("valid record");
    store.write("pair", &value).expect("writes");
    // Pair and one Cell
    assert_eq!(store.container().object_count(), 2);

    let read = store.read("pair").expect("reads").expect("bound");
    let record = read.as_record().expect("record");
    let a = record.get_named("a").expect("assigned");
    let b = record.get_named("b").expect("assigned");
    assert!(a.same_instance(&b));
    a.as_record()
        .expect("record")
        .set(0, Value::Int64(6))
        .expect("mutable");
    assert_eq!(
        b.as_record().expect("record").get(0),
        Some(Value::Int64(6))
    );
}

#[test]
fn it_preserves_cycles() {
    let (mut store, types) = store_with(vec![node()]);
    let node = &types[0];
    let a = Value::record(node, vec![Some(Value::Int64(1)), None]).expect("valid record");
    let b = Value::record(node, vec![Some(Value::Int64(2)), Some(a.clone())])
        .expect("valid record");
    a.as_record().expect("record").set(1, b).expect("mutable");
    store.write("ring", &a).expect("writes");
    assert_eq!(store.container().object_count(), 2);

    let read = store.read("ring").expect("reads").expect("bound");
    let first = read.as_record().expect("record");
    let second = first.get_named("next").expect("assigned");
    let second_record = second.as_record().expect("record");
    assert_eq!(second_record.get_named("value"), Some(Value::Int64(2)));
    let back = second_record.get_named("next").expect("assigned");
    assert!(back.same_instance(&read));
}

#[test]
fn it_commits_each_type_once() {
    let (mut store, types) = store_with(vec![point()]);
    let point = &types[0];
    for i in 0..10 {
        let value = Value::record(point, vec![Some(Value::Int64(i)), Some(Value::Int64(-i))])
            .expect("valid record");
        store.write(&format!("p{i}"), &value).expect("writes");
    }
    assert_eq!(store.committed().expect("lists").len(), 1);
    assert!(cached_codecs() > 0);
    let first = store.value_datatype(point, true).expect("commits");
    let second = store.value_datatype(point, true).expect("commits");
    assert_eq!(first, second);
    assert_eq!(first.index, 1);
}

#[test]
fn it_assigns_monotonic_indices() {
    let (mut store, types) = store_with(vec![point(), cell(), node()]);
    for ty in types.iter().chain(&[
        SourceType::Symbol,
        SourceType::BigInt,
        SourceType::WideString,
        SourceType::array(PrimitiveKind::Int16),
    ]) {
        store.value_datatype(ty, true).expect("commits");
    }
    let committed = store.committed().expect("lists");
    let indices: Vec<i64> = committed.iter().map(|c| c.index).collect();
    assert_eq!(indices, (1..=7).collect::<Vec<i64>>());
    let mut addresses: Vec<Address> = committed.iter().map(|c| c.address).collect();
    addresses.dedup();
    assert_eq!(addresses.len(), 7);
    assert!(committed[1].mutable);
    assert!(!committed[0].mutable);
}

#[test]
fn it_round_trips_special_types() {
    let mut types = TypeTable::new();
    let point = types.register_record(point());
    let doc = types.register_record(
        RecordType::immutable("doc::Entry")
            .field("tag", SourceType::Symbol)
            .field("size", SourceType::BigInt)
            .field("price", SourceType::BigDecimal)
            .field("title", SourceType::WideString)
            .field("kind", SourceType::Type)
            .field("initial", PrimitiveKind::Char)
            .field("ok", PrimitiveKind::Bool),
    );
    let mut store = Stowage::in_memory(types, InlinePolicy::default()).expect("creates store");
    let size = BigInt::parse_bytes(b"987654321987654321987654321", 10).expect("parses");
    let value = Value::record(
        &doc,
        vec![
            Some(Value::symbol("draft")),
            Some(Value::BigInt(size)),
            Some(Value::BigDecimal(Decimal::from_str("19.99").expect("parses"))),
            Some(Value::WideString("Überschrift".chars().collect())),
            Some(Value::Type(SourceType::array(point))),
            Some(Value::Char('Ü')),
            Some(Value::Bool(true)),
        ],
    )
    .expect("valid record");
    store.write("entry", &value).expect("writes");
    assert_eq!(store.read("entry").expect("reads").expect("bound"), value);
}

#[test]
fn it_round_trips_arrays() {
    let (mut store, types) = store_with(vec![cell()]);
    let cell = &types[0];
    let shared = Value::record(cell, vec![Some(Value::Int64(1))]).expect("valid record");
    let other = Value::record(cell, vec![Some(Value::Int64(2))]).expect("valid record");
    let value = Value::array(cell.clone(), vec![shared.clone(), shared, other]);
    store.write("cells", &value).expect("writes");
    let read = store.read("cells").expect("reads").expect("bound");
    let array = read.as_array().expect("array");
    assert_eq!(array.len(), 3);
    let items = array.items();
    assert!(items[0].same_instance(&items[1]));
    assert!(!items[0].same_instance(&items[2]));

    let mut rng = rand::thread_rng();
    let numbers: Vec<Value> = (0..500)
        .map(|_| Value::Float64(rng.gen_range(-1e6..1e6)))
        .collect();
    let value = Value::array(PrimitiveKind::Float64.into(), numbers);
    store.write("numbers", &value).expect("writes");
    assert_eq!(store.read("numbers").expect("reads").expect("bound"), value);
}

#[test]
fn it_stores_dynamic_slots_by_reference() {
    let (mut store, types) = store_with(vec![node()]);
    let node = &types[0];
    for next in [
        Value::string("tail"),
        Value::Int8(-1),
        Value::Tuple(vec![Value::Bool(false), Value::symbol("x")]),
    ] {
        let value = Value::record(node, vec![Some(Value::Int64(0)), Some(next.clone())])
            .expect("valid record");
        store.write("dyn", &value).expect("writes");
        let read = store.read("dyn").expect("reads").expect("bound");
        assert_eq!(read.as_record().expect("record").get_named("next"), Some(next));
    }
}

#[test]
fn it_follows_the_inline_policy() {
    let pair = SourceType::Tuple(vec![PrimitiveKind::Int8.into(), PrimitiveKind::Int8.into()]);
    let mut store =
        Stowage::in_memory(TypeTable::new(), InlinePolicy::default()).expect("creates store");
    assert_eq!(
        store.field_datatype(&pair, true).expect("derives").datatype,
        Datatype::Reference
    );

    let mut store =
        Stowage::in_memory(TypeTable::new(), InlinePolicy::inline_all()).expect("creates store");
    let handle = store.field_datatype(&pair, true).expect("derives");
    assert_eq!(handle.datatype.size(), 2);
    assert!(handle.is_committed());
    let value = Value::Tuple(vec![
        Value::Tuple(vec![Value::Int8(1), Value::Int8(2)]),
        Value::string("inline"),
    ]);
    store.write("t", &value).expect("writes");
    assert_eq!(store.container().object_count(), 1);
    assert_eq!(store.read("t").expect("reads").expect("bound"), value);
}

#[test_log::test(tokio::test)]
async fn it_records_the_inline_policy() {
    let path = "record_policy.stw";
    let store = Stowage::try_new(path, TypeTable::new(), InlinePolicy::inline_all())
        .await
        .expect("creates store");
    drop(store);
    let store = Stowage::try_open(path, TypeTable::new(), InlinePolicy::default())
        .await
        .expect("opens store");
    assert_eq!(store.policy(), InlinePolicy::inline_all());
    drop(store);
    std::fs::remove_file(path).expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_continues_indices_in_reopened_files() {
    let path = "continue_indices.stw";
    let mut types = TypeTable::new();
    let point = types.register_record(point());
    let mut store = Stowage::try_new(path, types.clone(), InlinePolicy::default())
        .await
        .expect("creates store");
    let value = Value::record(&point, vec![Some(Value::Int64(1)), Some(Value::Int64(2))])
        .expect("valid record");
    store.write("p", &value).expect("writes");
    drop(store);

    let mut store = Stowage::try_open(path, types, InlinePolicy::default())
        .await
        .expect("opens store");
    // Same type again: no new datatype
    store.write("q", &value).expect("writes");
    store.write("s", &Value::symbol("new")).expect("writes");
    let indices: Vec<i64> = store
        .committed()
        .expect("lists")
        .iter()
        .map(|c| c.index)
        .collect();
    assert_eq!(indices, vec![1, 2]);
    assert_eq!(store.read("p").expect("reads").expect("bound"), value);
    assert_eq!(store.read("q").expect("reads").expect("bound"), value);
    drop(store);
    std::fs::remove_file(path).expect("cleanup");
}

#[test]
fn it_rejects_unsupported_values() {
    let mut types = TypeTable::new();
    let ffi = types.register_record(
        RecordType::immutable("ffi::Callback").field("f", SourceType::Function),
    );
    let mut store = Stowage::in_memory(types, InlinePolicy::default()).expect("creates store");
    for value in [Value::Pointer(0x1000), Value::Function("main".to_string())] {
        let err = store.write("bad", &value).expect_err("unsupported");
        assert!(matches!(
            err.downcast_ref::<CodecError>(),
            Some(CodecError::UnsupportedType(_))
        ));
    }
    let err = store.value_datatype(&ffi, true).expect_err("unsupported");
    assert!(matches!(
        err.downcast_ref::<CodecError>(),
        Some(CodecError::UnsupportedType(_))
    ));
    assert!(store.links().is_empty());
}

#[test]
fn it_rejects_unassigned_inline_fields() {
    let (mut store, types) = store_with(vec![point()]);
    let value = Value::record(&types[0], vec![Some(Value::Int64(1)), None]).expect("valid record");
    let err = store.write("p", &value).expect_err("unassigned");
    assert!(matches!(
        err.downcast_ref::<CodecError>(),
        Some(CodecError::UnassignedInline { .. })
    ));
}

#[test]
fn it_decodes_into_caller_storage() {
    let (mut store, types) = store_with(vec![point()]);
    let point = &types[0];
    let size = store.value_datatype(point, true).expect("commits").datatype.size();
    let value = Value::record(point, vec![Some(Value::Int64(10)), Some(Value::Int64(20))])
        .expect("valid record");
    let mut session = WriteSession::new();
    let mut buf = vec![0; size];
    store.encode(&mut buf, &value, &mut session).expect("encodes");

    let mut dest = Value::record(point, vec![None, None]).expect("valid record");
    let before = dest.identity();
    store
        .decode_into(point, &buf, &session.into_heap(), &mut dest)
        .expect("decodes");
    assert_eq!(dest, value);
    assert_eq!(dest.identity(), before);

    // Shared storage is replaced rather than overwritten
    let mut shared = Value::record(point, vec![None, None]).expect("valid record");
    let alias = shared.clone();
    store
        .decode_into(point, &buf, &[], &mut shared)
        .expect("decodes");
    assert_eq!(shared, value);
    assert!(!shared.same_instance(&alias));
    let Value::Record(alias) = alias else {
        panic!("not a record");
    };
    assert_eq!(Rc::strong_count(&alias), 1);
}

#[test]
fn it_rebinds_names() {
    let (mut store, _) = store_with(vec![]);
    store.write("x", &Value::Int64(1)).expect("writes");
    let second = store.write("x", &Value::Int64(2)).expect("writes");
    assert_eq!(store.links(), vec![("x".to_string(), second)]);
    assert_eq!(store.read("x").expect("reads"), Some(Value::Int64(2)));
    assert_eq!(store.read("missing").expect("reads"), None);
}

#[test]
fn it_reports_lost_objects() {
    let (mut store, _) = store_with(vec![]);
    let err = store.read_reference(ObjRef(99)).expect_err("lost");
    assert!(matches!(
        err.downcast_ref::<ContainerError>(),
        Some(ContainerError::LostObject(99))
    ));
}

#[test]
fn it_regenerates_codecs_after_reset() {
    let (mut store, types) = store_with(vec![point()]);
    let value = Value::record(&types[0], vec![Some(Value::Int64(1)), Some(Value::Int64(1))])
        .expect("valid record");
    store.write("before", &value).expect("writes");
    reset_codecs();
    store.write("after", &value).expect("writes");
    assert_eq!(store.read("before").expect("reads").expect("bound"), value);
    assert_eq!(store.read("after").expect("reads").expect("bound"), value);
}

#[test]
fn it_preserves_cycles_through_immutable_records() {
    let mut types = TypeTable::new();
    let back = types.register_record(
        RecordType::mutable("geo::Back").field("owner", SourceType::Any),
    );
    let holder = types.register_record(RecordType::immutable("geo::Holder").field("back", back.clone()));
    let mut store = Stowage::in_memory(types, InlinePolicy::default()).expect("creates store");
    let link = Value::record(&back, vec![None]).expect("valid record");
    let value = Value::record(&holder, vec![Some(link.clone())]).expect("valid record");
    link.as_record()
        .expect("record")
        .set(0, value.clone())
        .expect("mutable");
    store.write("holder", &value).expect("writes");
    assert_eq!(store.container().object_count(), 2);

    let read = store.read("holder").expect("reads").expect("bound");
    let link = read
        .as_record()
        .expect("record")
        .get_named("back")
        .expect("assigned");
    let owner = link
        .as_record()
        .expect("record")
        .get_named("owner")
        .expect("assigned");
    assert!(owner.same_instance(&read));
    assert!(read == value);
}

#[test]
fn it_rejects_corrupt_array_lengths() {
    let (mut store, _) = store_with(vec![]);
    let ty = SourceType::array(PrimitiveKind::Int64);
    let mut slot = vec![0; 16];
    slot[8..].copy_from_slice(&(1u64 << 62).to_le_bytes());
    let err = store.decode(&ty, &slot, &[vec![]]).expect_err("corrupt");
    assert!(matches!(
        err.downcast_ref::<CodecError>(),
        Some(CodecError::Recognition(_))
    ));

    let empty = SourceType::array(SourceType::Tuple(vec![]));
    let err = store.decode(&empty, &slot, &[vec![]]).expect_err("corrupt");
    assert!(matches!(
        err.downcast_ref::<CodecError>(),
        Some(CodecError::Recognition(_))
    ));
}

#[test_log::test(tokio::test)]
async fn it_reads_type_values_naming_unknown_types() {
    let path = "type_value_gadget.stw";
    let mut types = TypeTable::new();
    let gadget = types.register_record(
        RecordType::immutable("shop::Gadget")
            .field("serial", PrimitiveKind::UInt32)
            .field("label", SourceType::ByteString),
    );
    let mut store = Stowage::try_new(path, types, InlinePolicy::default())
        .await
        .expect("creates store");
    // Only the type is stored, never a Gadget
    store
        .write("kind", &Value::Type(SourceType::array(gadget)))
        .expect("writes");
    drop(store);

    let mut store = Stowage::try_open(path, TypeTable::new(), InlinePolicy::default())
        .await
        .expect("opens store");
    let kind = store.read("kind").expect("reads").expect("bound");
    let Value::Type(ty) = kind else {
        panic!("not a type: {kind}");
    };
    assert_eq!(ty.qualified_name(), "array<shop::Gadget>");
    assert!(ty.is_reconstructed());
    let gadget = store
        .types()
        .get_reconstructed("shop::Gadget")
        .expect("reconstructed");
    let fields: Vec<String> = gadget
        .as_record()
        .expect("record")
        .fields()
        .iter()
        .map(|f| f.name.clone())
        .collect();
    assert_eq!(fields, vec!["serial".to_string(), "label".to_string()]);
    drop(store);
    std::fs::remove_file(path).expect("cleanup");
}

#[test]
fn it_round_trips_self_referential_types() {
    let (mut store, types) = store_with(vec![
        RecordType::mutable("geo::Link")
            .field("value", PrimitiveKind::Int64)
            .field("next", SourceType::named("geo::Link")),
        cell(),
    ]);
    let (link, cell) = (&types[0], &types[1]);
    assert_eq!(
        store
            .field_datatype(&SourceType::named("geo::Link"), true)
            .expect("derives")
            .datatype,
        Datatype::Reference
    );
    let handle = store.value_datatype(link, true).expect("commits");
    assert_eq!(handle.datatype.size(), 16);

    let a = Value::record(link, vec![Some(Value::Int64(1)), None]).expect("valid record");
    let b = Value::record(link, vec![Some(Value::Int64(2)), Some(a.clone())])
        .expect("valid record");
    a.as_record().expect("record").set(1, b).expect("mutable");
    store.write("chain", &a).expect("writes");
    let read = store.read("chain").expect("reads").expect("bound");
    let second = read
        .as_record()
        .expect("record")
        .get_named("next")
        .expect("assigned");
    let back = second
        .as_record()
        .expect("record")
        .get_named("next")
        .expect("assigned");
    assert!(back.same_instance(&read));
    assert!(read == a);

    let wrong = Value::record(cell, vec![Some(Value::Int64(0))]).expect("valid record");
    let value = Value::record(link, vec![Some(Value::Int64(3)), Some(wrong)])
        .expect("valid record");
    let err = store.write("wrong", &value).expect_err("mismatch");
    assert!(matches!(
        err.downcast_ref::<CodecError>(),
        Some(CodecError::ValueMismatch { .. })
    ));
}
