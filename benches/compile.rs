//! Benchmark serializer construction and pack throughput for both backends.

use divan::{black_box, Bencher};
use std::sync::Arc;

use packgen::target::{Getter, MemberDescriptor, Setter};
use packgen::{
    compile_serializer, CodecError, ContainerManager, ContainerMode, EmitterFlavor, GraphBuilder,
    OpcodeBuilder, SerializationContext, SerializationTarget, SerializerBuilder, Value, ValueType,
};

fn main() {
    divan::main();
}

fn seq_getter(i: usize) -> Getter {
    Arc::new(move |v| match v {
        Value::Seq(items) => items
            .get(i)
            .cloned()
            .ok_or_else(|| CodecError::Message(format!("missing field {i}"))),
        other => Err(CodecError::TypeMismatch {
            expected: ValueType::Seq,
            found: other.type_of(),
        }),
    })
}

fn seq_setter(i: usize) -> Setter {
    Arc::new(move |obj, val| match obj {
        Value::Seq(items) => {
            if items.len() <= i {
                items.resize(i + 1, Value::Nil);
            }
            items[i] = val;
            Ok(())
        }
        other => Err(CodecError::TypeMismatch {
            expected: ValueType::Seq,
            found: other.type_of(),
        }),
    })
}

fn wide_target(n_members: usize) -> Arc<SerializationTarget> {
    let members = (0..n_members)
        .map(|i| MemberDescriptor {
            name: format!("field_{i}"),
            value_type: ValueType::Int,
            get: seq_getter(i),
            set: seq_setter(i),
            collection: None,
            schema: None,
        })
        .collect();
    Arc::new(SerializationTarget {
        type_name: "Wide".to_owned(),
        members,
        tuple_like: true,
        self_pack: None,
    })
}

fn wide_value(n_members: usize) -> Value {
    Value::Seq((0..n_members).map(|i| Value::Int(i as i64)).collect())
}

fn graph_builder() -> GraphBuilder {
    GraphBuilder::default()
}

fn opcode_builder() -> OpcodeBuilder {
    OpcodeBuilder::new(
        Arc::new(ContainerManager::new()),
        ContainerMode::Fast,
        EmitterFlavor::FieldBased,
    )
}

#[divan::bench(args = [2, 8, 32])]
fn build_graph(bencher: Bencher, n_members: usize) {
    let target = wide_target(n_members);
    let builder = graph_builder();
    bencher.bench(|| {
        builder
            .build_serializer(black_box(target.clone()), None)
            .unwrap()
    });
}

#[divan::bench(args = [2, 8, 32])]
fn build_opcode(bencher: Bencher, n_members: usize) {
    let target = wide_target(n_members);
    let builder = opcode_builder();
    bencher.bench(|| {
        builder
            .build_serializer(black_box(target.clone()), None)
            .unwrap()
    });
}

#[divan::bench(args = [2, 8, 32])]
fn pack_graph(bencher: Bencher, n_members: usize) {
    let ser = compile_serializer(
        &graph_builder(),
        wide_target(n_members),
        Arc::new(SerializationContext::default()),
    )
    .unwrap();
    let value = wide_value(n_members);
    bencher.bench(|| ser.pack_to_vec(black_box(&value)).unwrap());
}

#[divan::bench(args = [2, 8, 32])]
fn pack_opcode(bencher: Bencher, n_members: usize) {
    let ser = compile_serializer(
        &opcode_builder(),
        wide_target(n_members),
        Arc::new(SerializationContext::default()),
    )
    .unwrap();
    let value = wide_value(n_members);
    bencher.bench(|| ser.pack_to_vec(black_box(&value)).unwrap());
}

#[divan::bench(args = [2, 8, 32])]
fn unpack_graph(bencher: Bencher, n_members: usize) {
    let ser = compile_serializer(
        &graph_builder(),
        wide_target(n_members),
        Arc::new(SerializationContext::default()),
    )
    .unwrap();
    let bytes = ser.pack_to_vec(&wide_value(n_members)).unwrap();
    bencher.bench(|| ser.unpack_from_slice(black_box(&bytes)).unwrap());
}
