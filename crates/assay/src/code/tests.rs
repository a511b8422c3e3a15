use super::*;

fn sample() -> (Code, Ref, Ref, Ref) {
    let mut code = Code::new();
    let block = code.add_block();
    let one = code
        .add_chunk(block, Chunk::primitive("", TypedValue::int(1)))
        .unwrap();
    let sum = code
        .add_chunk(
            block,
            Chunk::function("+int", Type::Int, Some(one), vec![TypedValue::int(2)]),
        )
        .unwrap();
    code.add_entrypoint(sum).unwrap();
    (code, block, one, sum)
}

#[test]
fn refs_pack_block_and_chunk() {
    let target = Ref::new(0, 0);
    assert_eq!(target.raw(), (1 << 32) | 1);
    assert_eq!(target.block_index(), Some(0));
    assert_eq!(target.chunk_index(), Some(0));
    assert!(Ref::block(2).is_block());
    assert_eq!(Ref::new(2, 5).block_ref(), Ref::block(2));
    assert_eq!(Ref::block(1).with_chunk(3), Ref::new(1, 3));
    assert_eq!(Ref::from_raw(0).block_index(), None);
    assert_eq!(Ref::new(0, 2).to_string(), "1:3");
}

#[test]
fn chunks_are_addressed_by_ref() {
    let (code, block, one, sum) = sample();
    assert_eq!(one, Ref::new(0, 0));
    assert_eq!(sum, Ref::new(0, 1));
    assert_eq!(code.tail_ref(block).unwrap(), sum);
    assert_eq!(code.chunk(sum).unwrap().id, "+int");
    assert!(matches!(code.chunk(Ref::new(0, 9)), Err(Error::InvalidRef(_))));
    assert!(matches!(code.block(Ref::block(3)), Err(Error::MissingBlock(_))));
    assert_eq!(code.entrypoints(), &[sum]);
    assert!(code.datapoints().is_empty());
}

#[test]
fn pop_chunk_drops_checksum_and_roles() {
    let (mut code, block, one, sum) = sample();
    let popped = code.pop_chunk(block).unwrap().unwrap();
    assert!(popped.was_entrypoint);
    assert!(!popped.was_datapoint);
    assert_eq!(popped.chunk.id, "+int");
    assert!(code.checksum_of(sum).is_err());
    assert!(code.entrypoints().is_empty());
    assert_eq!(code.tail_ref(block).unwrap(), one);

    code.pop_chunk(block).unwrap();
    assert!(code.pop_chunk(block).unwrap().is_none());
}

#[test]
fn argument_placeholders_count_parameters() {
    let mut code = Code::new();
    let block = code.add_block();
    let param = code
        .add_argument_placeholder(block, Type::Int, "element")
        .unwrap();
    assert_eq!(code.block(block).unwrap().parameters, 1);
    assert_eq!(code.checksum_of(param).unwrap(), "element");
}

#[test]
fn code_id_follows_entrypoints() {
    let (mut code, _, _, _) = sample();
    code.update_id().unwrap();
    let first = code.id.clone();
    assert!(!first.is_empty());

    let (mut same, _, _, _) = sample();
    same.update_id().unwrap();
    assert_eq!(same.id, first);

    let (mut other, block, one, _) = sample();
    let extra = other
        .add_chunk(
            block,
            Chunk::function("-int", Type::Int, Some(one), vec![TypedValue::int(2)]),
        )
        .unwrap();
    other.add_entrypoint(extra).unwrap();
    other.update_id().unwrap();
    assert_ne!(other.id, first);
}

#[test]
fn dereferenced_types_follow_literal_refs() {
    let (mut code, block, _, sum) = sample();
    let alias = code
        .add_chunk(block, Chunk::primitive("", TypedValue::reference(sum)))
        .unwrap();
    assert_eq!(code.chunk_type(alias).unwrap(), Type::Int);

    let inner = code.add_block();
    let lit = code
        .add_chunk(inner, Chunk::primitive("", TypedValue::string("x")))
        .unwrap();
    code.add_entrypoint(lit).unwrap();
    let block = code.block(inner).unwrap().clone();
    assert_eq!(code.dereferenced_block_type(&block), Type::String);
    assert_eq!(
        code.dereferenced_block_type(&code.blocks[0].clone()),
        Type::Int
    );
}

#[test]
fn ref_datapoints_explain_comparisons() {
    let mut code = Code::new();
    let block = code.add_block();
    let field = code
        .add_chunk(block, Chunk::property("count", Type::Int))
        .unwrap();
    let cmp = code
        .add_chunk(
            block,
            Chunk::function("==int", Type::Bool, Some(field), vec![TypedValue::int(3)]),
        )
        .unwrap();
    assert_eq!(code.ref_datapoints(cmp), vec![field]);

    let lit = code
        .add_chunk(block, Chunk::primitive("", TypedValue::int(3)))
        .unwrap();
    let static_cmp = code
        .add_chunk(
            block,
            Chunk::function(
                "==int",
                Type::Bool,
                Some(lit),
                vec![TypedValue::reference(field)],
            ),
        )
        .unwrap();
    assert_eq!(code.ref_datapoints(static_cmp), vec![field]);
    assert!(code.ref_datapoints(field).is_empty());
}

#[test]
fn json_round_trip() {
    let (mut code, _, _, _) = sample();
    code.update_id().unwrap();
    let text = code.to_json().unwrap();
    let back = Code::from_json(&text).unwrap();
    assert_eq!(back, code);
    assert!(Code::from_json("{\"blocks\": 3}").is_err());
}
