use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc, Mutex,
};

use gw_core::{
	replication::{
		LoopbackBus, MirrorListener, ReplicationClient, ReplicationMessage, ReplicationServer,
		SyncSnapshot,
	},
	AttributeKey, AttributeMapping, AttributeSet, AttributeType, AttributeValue, Diagnostic,
	FileStore, GaugeRecorder, GaugeValue, InstrumentDefinition, InstrumentKind,
	InstrumentRegistration, InstrumentRegistry, ObservationSource, PipelineConfig,
	RecordedSample, SourceConfiguration, SourceContainer, SourceId,
};
use pretty_assertions::assert_eq;
use tracing_test::traced_test;
use uuid::Uuid;

mod common;

use common::{
	pump,
	sources::{BrokenSource, CounterSource, SidedCounterSource, TankSource, TestDevice},
};

fn registry() -> InstrumentRegistry {
	InstrumentRegistry::new(Arc::new(PipelineConfig::default()))
}

fn container(
	registry: &InstrumentRegistry,
	sources: Vec<Arc<dyn ObservationSource<TestDevice>>>,
) -> SourceContainer<TestDevice> {
	SourceContainer::new(TestDevice::default(), Uuid::new_v4(), registry.clone(), sources)
}

fn long_values(samples: &[RecordedSample]) -> Vec<i64> {
	samples
		.iter()
		.map(|sample| match sample.value {
			GaugeValue::Long(v) => v,
			GaugeValue::Double(_) => unreachable!("long gauges only in this test"),
		})
		.collect()
}

#[test]
#[traced_test]
fn counter_scenario_binds_errors_and_rebinds() {
	let registry = registry();
	let instrument = registry
		.register_mutable(registry.gauge("game.test.counter"))
		.unwrap();

	let container = container(&registry, vec![Arc::new(CounterSource)]);
	let counter = SourceId::new("counter");

	container.setup();
	container.set_configuration(
		&counter,
		Some(Arc::new(SourceConfiguration::new(
			"game.test.counter",
			AttributeMapping::empty(),
		))),
	);

	// One observation before any value was set: exactly one sample of 0
	// with no attributes.
	let mut samples = Vec::<RecordedSample>::new();
	registry.collect(&mut samples);
	assert_eq!(long_values(&samples), vec![0]);
	assert!(samples[0].attributes.is_empty());

	container.context().set_counter(5);
	samples.clear();
	registry.collect(&mut samples);
	assert_eq!(long_values(&samples), vec![5]);

	// Removing the instrument leaves the binding in a persistent
	// "not found" error on the next dirty trigger.
	instrument.registration().close();
	samples.clear();
	registry.collect(&mut samples);
	assert!(samples.is_empty());

	container.mark_dirty(&counter);
	let errors = container
		.with_state(&counter, |state| state.error_state().errors().to_vec())
		.unwrap();
	assert_eq!(
		errors,
		vec![Diagnostic::InstrumentNotFound {
			name: "game.test.counter".into()
		}]
	);

	// Re-registering plus one more dirty trigger re-binds without any
	// manual intervention.
	registry
		.register_mutable(registry.gauge("game.test.counter"))
		.unwrap();
	container.mark_dirty(&counter);

	assert!(container
		.with_state(&counter, |state| state.error_state().is_ok())
		.unwrap());

	samples.clear();
	registry.collect(&mut samples);
	assert_eq!(long_values(&samples), vec![5]);
}

#[test]
fn same_configuration_reference_notifies_dirty_once() {
	let registry = registry();
	registry
		.register_mutable(registry.gauge("game.test.counter"))
		.unwrap();

	let container = container(&registry, vec![Arc::new(CounterSource)]);
	container.setup();

	let notifications = Arc::new(AtomicUsize::new(0));
	container.subscribe_dirty(Arc::new({
		let notifications = Arc::clone(&notifications);
		move |_| {
			notifications.fetch_add(1, Ordering::SeqCst);
		}
	}));

	let configuration = Arc::new(SourceConfiguration::new(
		"game.test.counter",
		AttributeMapping::empty(),
	));
	let counter = SourceId::new("counter");

	container.set_configuration(&counter, Some(Arc::clone(&configuration)));
	container.set_configuration(&counter, Some(configuration));

	assert_eq!(notifications.load(Ordering::SeqCst), 1);
}

#[test]
fn tank_levels_map_per_fluid_or_roll_up() {
	let registry = registry();
	registry
		.register_mutable(
			registry
				.gauge("game.tank.level")
				.unit("mB")
				.attribute(AttributeKey::new("fluid", AttributeType::Str)),
		)
		.unwrap();
	registry
		.register_mutable(registry.gauge("game.tank.total").unit("mB"))
		.unwrap();

	let container = container(&registry, vec![Arc::new(TankSource)]);
	let tank = SourceId::new("tank_levels");
	container.setup();
	container
		.context()
		.set_tanks(vec![("water".into(), 100), ("lava".into(), 50)]);

	// Per-fluid: the instrument declares the attribute, so the source
	// reports one sample per tank.
	container.set_configuration(
		&tank,
		Some(Arc::new(SourceConfiguration::new(
			"game.tank.level",
			AttributeMapping::empty().with(
				AttributeKey::new("fluid", AttributeType::Str),
				AttributeKey::new("fluid", AttributeType::Str),
			),
		))),
	);

	let mut samples = Vec::<RecordedSample>::new();
	registry.collect(&mut samples);
	let mut per_fluid = samples
		.iter()
		.map(|sample| {
			(
				sample.attributes.get("fluid").cloned(),
				match sample.value {
					GaugeValue::Long(v) => v,
					GaugeValue::Double(_) => unreachable!(),
				},
			)
		})
		.collect::<Vec<_>>();
	per_fluid.sort_by_key(|(_, amount)| *amount);
	assert_eq!(
		per_fluid,
		vec![
			(Some(AttributeValue::Str("lava".into())), 50),
			(Some(AttributeValue::Str("water".into())), 100),
		]
	);

	// Rolled up: the total instrument has no attributes, "fluid" becomes
	// unused and the source skips the per-tank breakdown.
	container.set_configuration(
		&tank,
		Some(Arc::new(SourceConfiguration::new(
			"game.tank.total",
			AttributeMapping::empty(),
		))),
	);

	samples.clear();
	registry.collect(&mut samples);
	assert_eq!(long_values(&samples), vec![150]);
	assert!(samples[0].attributes.is_empty());
}

#[test]
fn payload_feeds_parameterized_attributes() {
	let registry = registry();
	registry
		.register_mutable(
			registry
				.gauge("game.sided.counter")
				.attribute(AttributeKey::new("side", AttributeType::Long)),
		)
		.unwrap();

	let container = container(&registry, vec![Arc::new(SidedCounterSource)]);
	container.setup();
	container.context().set_counter(7);

	container.set_configuration(
		&SourceId::new("sided_counter"),
		Some(Arc::new(
			SourceConfiguration::new(
				"game.sided.counter",
				AttributeMapping::empty().with(
					AttributeKey::new("side", AttributeType::Long),
					AttributeKey::new("side", AttributeType::Long),
				),
			)
			.with_payload(AttributeSet::new().with("side", AttributeValue::Long(2))),
		)),
	);

	let mut samples = Vec::<RecordedSample>::new();
	registry.collect(&mut samples);
	assert_eq!(long_values(&samples), vec![7]);
	assert_eq!(
		samples[0].attributes.get("side"),
		Some(&AttributeValue::Long(2))
	);
}

#[test]
fn failing_source_does_not_abort_siblings() {
	let registry = registry();
	registry
		.register_mutable(registry.gauge("game.test.counter"))
		.unwrap();
	registry
		.register_mutable(registry.gauge("game.test.broken"))
		.unwrap();

	let container = container(
		&registry,
		vec![Arc::new(CounterSource), Arc::new(BrokenSource)],
	);
	container.setup();
	container.context().set_counter(3);
	container.set_configuration(
		&SourceId::new("counter"),
		Some(Arc::new(SourceConfiguration::new(
			"game.test.counter",
			AttributeMapping::empty(),
		))),
	);
	container.set_configuration(
		&SourceId::new("broken"),
		Some(Arc::new(SourceConfiguration::new(
			"game.test.broken",
			AttributeMapping::empty(),
		))),
	);

	let mut samples = Vec::<RecordedSample>::new();
	container.observe(&mut samples, None);

	assert_eq!(long_values(&samples), vec![3]);
	let errors = container
		.with_state(&SourceId::new("broken"), |state| {
			state.error_state().errors().to_vec()
		})
		.unwrap();
	assert_eq!(
		errors,
		vec![Diagnostic::SourceFailure {
			message: "device exploded".into()
		}]
	);

	// The errored binding stays out of later batches; the sibling keeps
	// observing.
	samples.clear();
	container.observe(&mut samples, None);
	assert_eq!(long_values(&samples), vec![3]);
}

#[test]
fn container_state_survives_restart_through_the_store() {
	let dir = tempfile::tempdir().unwrap();
	let store = FileStore::new(dir.path()).unwrap();

	let registry = registry();
	registry
		.register_mutable(registry.gauge("game.test.counter"))
		.unwrap();

	let context_id = Uuid::new_v4();
	let configuration = Arc::new(SourceConfiguration::new(
		"game.test.counter",
		AttributeMapping::empty(),
	));

	{
		let container = SourceContainer::new(
			TestDevice::default(),
			context_id,
			registry.clone(),
			vec![Arc::new(CounterSource) as Arc<dyn ObservationSource<TestDevice>>],
		);
		container.setup();
		container.set_configuration(&SourceId::new("counter"), Some(configuration));
		container.save(&store).unwrap();
	}

	// A fresh container for the same context: load, then activate.
	let restored = SourceContainer::new(
		TestDevice::default(),
		context_id,
		registry.clone(),
		vec![Arc::new(CounterSource) as Arc<dyn ObservationSource<TestDevice>>],
	);
	restored.load(&store).unwrap();
	restored.setup();

	assert!(restored
		.with_state(&SourceId::new("counter"), |state| {
			state.configuration().is_some() && state.bound_instrument().is_some()
		})
		.unwrap());

	restored.context().set_counter(11);
	let mut samples = Vec::<RecordedSample>::new();
	registry.collect(&mut samples);
	assert_eq!(long_values(&samples), vec![11]);
}

#[test]
#[traced_test]
fn registry_events_replicate_to_the_mirror() {
	let bus = LoopbackBus::new();
	let server_registry = registry();
	let server = ReplicationServer::new(server_registry.clone(), bus.server_transport());

	let peer = Uuid::new_v4();
	bus.register_peer(peer);
	let client = ReplicationClient::new(bus.client_sender(peer), None);

	let mirrored = server_registry
		.register_mutable(
			server_registry
				.gauge("game.energy.stored")
				.description("stored energy")
				.unit("J")
				.kind(InstrumentKind::Double),
		)
		.unwrap();
	server_registry
		.register_immutable(
			server_registry.gauge("game.local.only"),
			|_: &InstrumentRegistration, recorder: &mut dyn GaugeRecorder| {
				recorder.record(GaugeValue::Long(1), &AttributeSet::new());
			},
		)
		.unwrap();

	pump(&bus, &server, &[(peer, &client)]);

	// Mutable instruments mirror in full; immutable ones only reserve
	// their name.
	let stored = client.get("game.energy.stored").unwrap();
	assert_eq!(stored.unit(), "J");
	assert_eq!(stored.kind(), InstrumentKind::Double);
	assert!(client.get("game.local.only").is_none());
	assert!(client.is_reserved("game.local.only"));

	mirrored.registration().close();
	pump(&bus, &server, &[(peer, &client)]);
	assert!(client.get("game.energy.stored").is_none());

	// A client-requested ad-hoc instrument lands in the authoritative
	// registry and echoes back through the broadcast.
	let definition = InstrumentDefinition::new(
		"game.requested",
		"requested from the client",
		"",
		InstrumentKind::Long,
		false,
		[],
		&PipelineConfig::default(),
	)
	.unwrap();
	client.request_instrument(definition.clone());
	pump(&bus, &server, &[(peer, &client)]);

	assert!(server_registry.get_mutable("game.requested").is_some());
	assert_eq!(client.get("game.requested"), Some(definition));
}

#[derive(Default)]
struct CountingMirror {
	added: AtomicUsize,
	removed: AtomicUsize,
	last_removed: Mutex<Option<String>>,
}

impl MirrorListener for CountingMirror {
	fn instrument_added(&self, _: &InstrumentDefinition) {
		self.added.fetch_add(1, Ordering::SeqCst);
	}

	fn instrument_removed(&self, definition: &InstrumentDefinition) {
		self.removed.fetch_add(1, Ordering::SeqCst);
		*self.last_removed.lock().unwrap() = Some(definition.name().to_owned());
	}
}

#[test]
fn populate_diffs_instead_of_replaying() {
	let bus = LoopbackBus::new();
	let peer = Uuid::new_v4();
	bus.register_peer(peer);
	let client = ReplicationClient::new(bus.client_sender(peer), None);

	let listener = Arc::new(CountingMirror::default());
	client.subscribe(listener.clone());

	let config = PipelineConfig::default();
	let energy = InstrumentDefinition::new(
		"game.energy.stored",
		"",
		"J",
		InstrumentKind::Double,
		false,
		[],
		&config,
	)
	.unwrap();
	let ticks = InstrumentDefinition::new(
		"game.ticks",
		"",
		"",
		InstrumentKind::Long,
		false,
		[],
		&config,
	)
	.unwrap();

	let snapshot = SyncSnapshot {
		reserved_names: ["game.local.only".to_owned()].into(),
		instruments: vec![energy.clone(), ticks.clone()],
	};

	assert!(client.populate(snapshot.clone()));
	assert_eq!(listener.added.load(Ordering::SeqCst), 2);

	// Identical snapshot: zero callbacks, not a re-population.
	assert!(!client.populate(snapshot));
	assert_eq!(listener.added.load(Ordering::SeqCst), 2);
	assert_eq!(listener.removed.load(Ordering::SeqCst), 0);

	// One instrument vanished: exactly one remove, no adds.
	assert!(!client.populate(SyncSnapshot {
		reserved_names: ["game.local.only".to_owned()].into(),
		instruments: vec![energy],
	}));
	assert_eq!(listener.added.load(Ordering::SeqCst), 2);
	assert_eq!(listener.removed.load(Ordering::SeqCst), 1);
	assert_eq!(
		listener.last_removed.lock().unwrap().as_deref(),
		Some("game.ticks")
	);
	assert!(client.get("game.ticks").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn await_full_update_coalesces_concurrent_callers() {
	let bus = LoopbackBus::new();
	let server_registry = registry();
	let server = ReplicationServer::new(server_registry.clone(), bus.server_transport());

	server_registry
		.register_mutable(server_registry.gauge("game.energy.stored"))
		.unwrap();

	let peer = Uuid::new_v4();
	bus.register_peer(peer);
	// Drop the broadcast triggered by the registration above; this test
	// only cares about the snapshot path.
	let _ = bus.drain_client(peer);

	let client = ReplicationClient::new(bus.client_sender(peer), None);

	let first = tokio::spawn({
		let client = client.clone();
		async move { client.await_full_update().await }
	});
	let second = tokio::spawn({
		let client = client.clone();
		async move { client.await_full_update().await }
	});

	tokio::time::sleep(std::time::Duration::from_millis(100)).await;

	// Both awaiters coalesced onto one in-flight token: one wire request.
	let requests = bus.drain_server();
	assert_eq!(requests.len(), 1);
	assert!(matches!(requests[0].1, ReplicationMessage::FullSyncRequest));

	// Requesting again while the sync is outstanding is a no-op.
	client.request_full_update();
	assert!(bus.drain_server().is_empty());

	for (from, message) in requests {
		server.handle_message(from, message);
	}
	for message in bus.drain_client(peer) {
		client.apply(message);
	}

	first.await.unwrap();
	second.await.unwrap();

	assert!(client.is_populated());
	assert!(client.get("game.energy.stored").is_some());
}
