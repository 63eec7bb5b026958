//! End-to-end reconciliation scenarios through the engine facade.

use converge::{
    ChangeKind, Declaration, Engine, ExecuteOptions, Expr, FieldDescriptor, MemoryBackend,
    NullReporter, PlanOptions, Reference, ResourceKey, ResourceSpec, ResourceType, SourceLocation,
    StateBackend, TypeRegistry,
};
use std::sync::{Arc, Mutex};

/// Provider stub that records every lifecycle call in a shared log.
struct RecordingType {
    type_name: &'static str,
    fields: &'static [FieldDescriptor],
    log: Arc<Mutex<Vec<String>>>,
}

impl ResourceType for RecordingType {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn fields(&self) -> &'static [FieldDescriptor] {
        self.fields
    }

    fn refresh(&self, _spec: &mut ResourceSpec) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn create(&self, spec: &mut ResourceSpec) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("create {} {}", self.type_name, spec.name));
        spec.set_field("asset-id", format!("{}-{}", self.type_name, spec.name));
        Ok(())
    }

    fn update(&self, _current: &ResourceSpec, pending: &mut ResourceSpec, changed: &[String]) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!(
            "update {} {} [{}]",
            self.type_name,
            pending.name,
            changed.join(", ")
        ));
        Ok(())
    }

    fn delete(&self, spec: &ResourceSpec) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("delete {} {}", self.type_name, spec.name));
        Ok(())
    }
}

const VPC_FIELDS: &[FieldDescriptor] = &[FieldDescriptor::immutable("cidr")];
const SUBNET_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::immutable("az"),
    FieldDescriptor::updatable("map-public-ip"),
    FieldDescriptor::updatable("cidr").nullable(),
    FieldDescriptor::updatable("vpc-id").nullable(),
];
const EIP_FIELDS: &[FieldDescriptor] = &[FieldDescriptor::updatable("pool").nullable()];
const SG_FIELDS: &[FieldDescriptor] = &[FieldDescriptor::updatable("ingress").nullable()];

struct Harness {
    engine: Engine,
    log: Arc<Mutex<Vec<String>>>,
    backend: Arc<MemoryBackend>,
}

/// Engine wired with recording vpc/subnet/eip types over an in-memory
/// backend.
fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = TypeRegistry::new();
    for (type_name, fields) in [
        ("vpc", VPC_FIELDS),
        ("subnet", SUBNET_FIELDS),
        ("eip", EIP_FIELDS),
        ("security-group", SG_FIELDS),
    ] {
        registry.register(Arc::new(RecordingType {
            type_name,
            fields,
            log: log.clone(),
        }));
    }
    let backend = Arc::new(MemoryBackend::new());
    struct Shared(Arc<MemoryBackend>);
    impl converge::StateBackend for Shared {
        fn load(&self, root: &str) -> anyhow::Result<Vec<ResourceSpec>> {
            self.0.load(root)
        }
        fn save(&self, root: &str, resources: &[ResourceSpec]) -> anyhow::Result<()> {
            self.0.save(root, resources)
        }
    }
    Harness {
        engine: Engine::new(registry, Box::new(Shared(backend.clone()))),
        log,
        backend,
    }
}

fn loc(line: u32) -> SourceLocation {
    SourceLocation::new("net.cfg", line, 1)
}

fn vpc_decl(name: &str, cidr: &str, line: u32) -> Declaration {
    Declaration::resource(
        "vpc",
        Expr::literal(name),
        vec![Declaration::pair("cidr", Expr::literal(cidr), loc(line))],
        loc(line),
    )
}

#[test]
fn scenario_empty_state_creates_declared_vpc() {
    let h = harness();
    let body = vec![vpc_decl("v1", "10.0.0.0/16", 1)];

    let plan = h.engine.plan("net", &body, &PlanOptions::default()).unwrap();
    assert_eq!(plan.len(), 1);
    let (_, change) = plan.changes().next().unwrap();
    assert_eq!(change.kind, ChangeKind::Create);
    assert_eq!(change.display(), "vpc v1");

    let summary = h
        .engine
        .apply("net", &plan, &ExecuteOptions::default(), &NullReporter)
        .unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(h.log.lock().unwrap().as_slice(), ["create vpc v1"]);
}

#[test]
fn scenario_updatable_field_change_applies_in_place() {
    let h = harness();
    h.backend.seed(
        "net",
        vec![ResourceSpec::new("subnet", "s1")
            .with_field("az", "a")
            .with_field("map-public-ip", false)],
    );

    let body = vec![Declaration::resource(
        "subnet",
        Expr::literal("s1"),
        vec![
            Declaration::pair("az", Expr::literal("a"), loc(2)),
            Declaration::pair("map-public-ip", Expr::literal(true), loc(3)),
        ],
        loc(1),
    )];

    let plan = h.engine.plan("net", &body, &PlanOptions::default()).unwrap();
    let (_, change) = plan.changes().next().unwrap();
    assert_eq!(change.kind, ChangeKind::Update);

    h.engine
        .apply("net", &plan, &ExecuteOptions::default(), &NullReporter)
        .unwrap();
    assert_eq!(
        h.log.lock().unwrap().as_slice(),
        ["update subnet s1 [map-public-ip]"]
    );
}

#[test]
fn scenario_immutable_field_change_requires_replacement() {
    let h = harness();
    h.backend.seed(
        "net",
        vec![ResourceSpec::new("subnet", "s1")
            .with_field("az", "a")
            .with_field("map-public-ip", false)],
    );

    let body = vec![Declaration::resource(
        "subnet",
        Expr::literal("s1"),
        vec![
            Declaration::pair("az", Expr::literal("b"), loc(2)),
            Declaration::pair("map-public-ip", Expr::literal(false), loc(3)),
        ],
        loc(1),
    )];

    let plan = h.engine.plan("net", &body, &PlanOptions::default()).unwrap();
    let (_, change) = plan.changes().next().unwrap();
    assert_eq!(change.kind, ChangeKind::Replace);

    // Replacement is surfaced, never applied automatically.
    let summary = h
        .engine
        .apply("net", &plan, &ExecuteOptions::default(), &NullReporter)
        .unwrap();
    assert_eq!(summary.skipped, 1);
    assert!(h.log.lock().unwrap().is_empty());
}

#[test]
fn scenario_removed_resource_deleted_after_its_dependents() {
    let h = harness();
    let mut eip = ResourceSpec::new("eip", "e1");
    eip.set_field("pool", "default");
    let mut consumer = ResourceSpec::new("subnet", "s1");
    consumer.set_field("az", "a");
    consumer.depends_on.push(ResourceKey::new("eip", "e1"));
    h.backend.seed("net", vec![eip, consumer]);

    // Everything disappears from the declaration.
    let plan = h.engine.plan("net", &[], &PlanOptions::default()).unwrap();
    assert_eq!(plan.len(), 2);

    let summary = h
        .engine
        .apply("net", &plan, &ExecuteOptions::default(), &NullReporter)
        .unwrap();
    assert_eq!(summary.deleted, 2);

    // The consumer is torn down before the resource it depends on.
    let log = h.log.lock().unwrap();
    assert_eq!(log.as_slice(), ["delete subnet s1", "delete eip e1"]);
    drop(log);

    assert!(h.backend.load("net").unwrap().is_empty());
}

#[test]
fn scenario_forward_reference_resolves_on_second_pass() {
    let h = harness();
    // The subnet references the vpc's provider-assigned id before the vpc
    // is declared.
    let body = vec![
        Declaration::resource(
            "subnet",
            Expr::literal("s1"),
            vec![
                Declaration::pair("az", Expr::literal("a"), loc(2)),
                Declaration::pair("map-public-ip", Expr::literal(false), loc(3)),
                Declaration::pair(
                    "vpc-id",
                    Expr::reference(Reference::resource_attr("vpc", Expr::literal("my-vpc"), "asset-id")),
                    loc(4),
                ),
            ],
            loc(1),
        ),
        vpc_decl("my-vpc", "10.0.0.0/16", 6),
    ];

    let plan = h.engine.plan("net", &body, &PlanOptions::default()).unwrap();
    let subnet_id = plan.change_for(&ResourceKey::new("subnet", "s1")).unwrap();
    let vpc_id = plan.change_for(&ResourceKey::new("vpc", "my-vpc")).unwrap();
    assert!(plan.change(subnet_id).dependencies.contains(&vpc_id));

    h.engine
        .apply("net", &plan, &ExecuteOptions::default(), &NullReporter)
        .unwrap();

    // The vpc is created first and the subnet sees its assigned id.
    let log = h.log.lock().unwrap();
    assert_eq!(log[0], "create vpc my-vpc");
    drop(log);

    let realized = plan.outcome(subnet_id).unwrap();
    assert_eq!(
        realized.spec().unwrap().field("vpc-id"),
        Some(&converge::Value::from("vpc-my-vpc"))
    );
}

#[test]
fn scenario_block_late_reference_bound_before_provider_call() {
    let h = harness();
    let body = vec![
        vpc_decl("v1", "10.0.0.0/16", 1),
        Declaration::resource(
            "security-group",
            Expr::literal("web"),
            vec![Declaration::block(
                "ingress",
                vec![
                    Declaration::pair("port", Expr::literal(443), loc(4)),
                    Declaration::pair(
                        "source-vpc",
                        Expr::reference(Reference::resource_attr("vpc", Expr::literal("v1"), "asset-id")),
                        loc(5),
                    ),
                ],
                loc(3),
            )],
            loc(2),
        ),
    ];

    let plan = h.engine.plan("net", &body, &PlanOptions::default()).unwrap();
    h.engine
        .apply("net", &plan, &ExecuteOptions::default(), &NullReporter)
        .unwrap();

    // The provider-assigned vpc id reaches the block entry, not a null.
    let sg_id = plan.change_for(&ResourceKey::new("security-group", "web")).unwrap();
    let realized = plan.outcome(sg_id).unwrap();
    let rules = realized.spec().unwrap().field("ingress").unwrap();
    let entry = rules.as_list().unwrap()[0].as_map().unwrap();
    assert_eq!(entry.get("source-vpc"), Some(&converge::Value::from("vpc-v1")));
}

#[test]
fn scenario_unsatisfiable_references_deadlock_with_report() {
    let h = harness();
    let body = vec![Declaration::resource(
        "subnet",
        Expr::literal("s1"),
        vec![Declaration::pair(
            "vpc-id",
            Expr::reference(Reference::resource_attr("vpc", Expr::literal("ghost"), "asset-id")),
            loc(2),
        )],
        loc(1),
    )];

    let err = h.engine.plan("net", &body, &PlanOptions::default()).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("unable to resolve"), "unexpected error: {message}");

    let chain = format!("{err:#}");
    assert!(chain.contains("net.cfg:1:1"), "missing location in: {chain}");
}

#[test]
fn scenario_repeated_apply_is_idempotent() {
    let h = harness();
    let body = vec![vpc_decl("v1", "10.0.0.0/16", 1)];

    let plan = h.engine.plan("net", &body, &PlanOptions::default()).unwrap();
    h.engine
        .apply("net", &plan, &ExecuteOptions::default(), &NullReporter)
        .unwrap();

    let again = h.engine.plan("net", &body, &PlanOptions::default()).unwrap();
    assert!(!again.has_changes());

    let summary = h
        .engine
        .apply("net", &again, &ExecuteOptions::default(), &NullReporter)
        .unwrap();
    assert_eq!(summary.kept, 1);
    assert_eq!(h.log.lock().unwrap().len(), 1);
}

#[test]
fn scenario_parallel_apply_respects_dependency_order() {
    let h = harness();
    // One vpc, four subnets referencing it.
    let mut body = vec![vpc_decl("hub", "10.0.0.0/16", 1)];
    for (i, name) in ["s1", "s2", "s3", "s4"].iter().enumerate() {
        body.push(Declaration::resource(
            "subnet",
            Expr::literal(*name),
            vec![
                Declaration::pair("az", Expr::literal("a"), loc(10 + i as u32)),
                Declaration::pair("map-public-ip", Expr::literal(false), loc(10 + i as u32)),
                Declaration::pair(
                    "vpc-id",
                    Expr::reference(Reference::resource_attr("vpc", Expr::literal("hub"), "asset-id")),
                    loc(10 + i as u32),
                ),
            ],
            loc(10 + i as u32),
        ));
    }

    let plan = h.engine.plan("net", &body, &PlanOptions::default()).unwrap();
    let options = ExecuteOptions {
        jobs: 4,
        ..ExecuteOptions::default()
    };
    let summary = h.engine.apply("net", &plan, &options, &NullReporter).unwrap();
    assert_eq!(summary.created, 5);

    let log = h.log.lock().unwrap();
    assert_eq!(log[0], "create vpc hub");
    assert_eq!(log.len(), 5);
}
