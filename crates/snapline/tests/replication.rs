use snapline::net::{
    DecodedTick, DeclaredPriority, FragmentAssembler, PAYLOAD_HEADER_SIZE, ReplicationSender,
    fragment,
};
use snapline::{ClientId, NetworkId, TypeConfig, TypeRegistry, World, WorldHistory, networked};

networked! {
    struct Beacon {
        signal: u32,
    }
}

networked! {
    struct Marker {
        signal: u32,
    }
}

networked! {
    struct Siren {
        signal: u32,
    }
}

#[test]
fn lost_fragment_costs_the_whole_tick() {
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let fragments = fragment(7, &payload, 300);
    assert_eq!(fragments.len(), 4);

    let mut assembler = FragmentAssembler::new();
    for (index, piece) in fragments.iter().enumerate() {
        if index == 2 {
            continue;
        }
        assert!(assembler.insert(piece.clone()).unwrap().is_none());
    }

    // A complete later tick supersedes the broken one.
    let next = fragment(8, &payload, 300);
    let mut completed = None;
    for piece in next.into_iter().rev() {
        completed = assembler.insert(piece).unwrap().or(completed);
    }
    let (tick, buffer) = completed.expect("tick 8 completes");
    assert_eq!(tick, 8);
    assert_eq!(buffer.as_slice(), payload.as_slice());
    assert_eq!(assembler.discarded_ticks(), 1);
    assert_eq!(assembler.pending_ticks(), 0);

    // The late missing piece of tick 7 no longer matters.
    assembler.mark_applied(8);
    assert!(assembler.insert(fragments[2].clone()).unwrap().is_none());
}

/// One entity per tick fits the budget, so send order is visible tick by
/// tick.
#[test]
fn priority_decides_what_goes_first() {
    let registry = TypeRegistry::builder()
        .register::<Beacon>(TypeConfig::with_capacity(1).priority(1))
        .unwrap()
        .register::<Marker>(TypeConfig::with_capacity(1).priority(0))
        .unwrap()
        .register::<Siren>(TypeConfig::with_capacity(1).priority(5))
        .unwrap()
        .build();
    let mut world = World::new(registry.clone());
    let a = world.spawn_as::<Beacon>(None).unwrap();
    let b = world.spawn_as::<Marker>(None).unwrap();
    let c = world.spawn_as::<Siren>(None).unwrap();

    let block = registry.block_size("Beacon").unwrap();
    let mut sender = ReplicationSender::new(ClientId(1), PAYLOAD_HEADER_SIZE + 16 + block);
    let mut history = WorldHistory::new(16);
    let mut replica = World::new(registry.clone());

    let mut order: Vec<NetworkId> = Vec::new();
    for tick in 1..=3 {
        history.capture(tick, &world);
        let encoded = sender.build(tick, &world, &history, &mut DeclaredPriority);
        assert_eq!(encoded.sent.len(), 1);
        order.extend(&encoded.sent);

        let mut payload = snapline::NetBuffer::from_bytes(&encoded.payload);
        let decoded =
            DecodedTick::decode(tick, &mut payload, &registry, replica.metas().len()).unwrap();
        decoded.apply(&mut replica).unwrap();
        sender.acknowledge(tick);
    }

    assert_eq!(order, vec![c, a, b]);
    assert_eq!(replica.checksum(), world.checksum());
}
