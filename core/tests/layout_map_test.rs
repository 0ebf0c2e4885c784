use meshtrain::dtensor::{UNSHARDED, UnmatchedPolicy};
use meshtrain::mesh::{DeviceType, Mesh, MeshDescription, MeshDim};
use meshtrain::models::{BertClassifier, BertConfig, default_layout_map};
use meshtrain::nn::{Module, ParameterBuilder};
use meshtrain::{Layout, LayoutMap, MeshError, run_on};

fn mesh(client: usize) -> Mesh {
    let description = MeshDescription::new(
        vec![MeshDim::new("batch", 4), MeshDim::new("model", 2)],
        DeviceType::Cpu,
        8,
    );
    Mesh::new(description, client, 2).unwrap()
}

fn small_config() -> BertConfig {
    BertConfig {
        hidden_size: 8,
        intermediate_size: 16,
        num_layers: 2,
        ..BertConfig::default()
    }
}

#[test]
fn test_default_rules_shard_pooler_and_output_dense() {
    let mesh = mesh(1);
    let map = default_layout_map(&mesh, "model").unwrap();
    let mut builder = ParameterBuilder::new(&map, 7);
    let model = run_on(&mesh, || BertClassifier::new(small_config(), &mut builder)).unwrap();

    let layouts: Vec<(String, Vec<String>, Vec<usize>)> = model
        .trainable_parameters()
        .iter()
        .map(|p| (p.name().to_string(), p.layout().sharding_specs(), p.local_shape()))
        .collect();
    let find = |name: &str| {
        layouts
            .iter()
            .find(|(n, ..)| n == name)
            .unwrap_or_else(|| panic!("no parameter {name}"))
    };

    let pooler = find("encoder/pooler_transform/kernel");
    assert_eq!(pooler.1, vec![UNSHARDED, "model"]);
    assert_eq!(pooler.2, vec![8, 4]);
    assert_eq!(find("encoder/pooler_transform/bias").2, vec![4]);

    for layer in 0..2 {
        let kernel = find(&format!("encoder/transformer/layer_{layer}/_output_dense/kernel"));
        assert_eq!(kernel.1, vec!["model", UNSHARDED]);
        assert_eq!(kernel.2, vec![8, 8]);
        let bias = find(&format!("encoder/transformer/layer_{layer}/_output_dense/bias"));
        assert_eq!(bias.1, vec![UNSHARDED]);
        let intermediate = find(&format!("encoder/transformer/layer_{layer}/intermediate/kernel"));
        assert_eq!(intermediate.1, vec![UNSHARDED, UNSHARDED]);
    }
    assert_eq!(find("classifier/kernel").1, vec![UNSHARDED, UNSHARDED]);
    assert_eq!(layouts.len(), 2 + 4 * 2 + 4);
}

#[test]
fn test_first_matching_rule_wins() {
    let mesh = mesh(0);
    let map = LayoutMap::new(&mesh)
        .rule("encoder/.*", &["model", UNSHARDED])
        .unwrap()
        .rule("encoder/pooler_transform/kernel", &[UNSHARDED, "model"])
        .unwrap()
        .rule("encoder/pooler.*", &[UNSHARDED, UNSHARDED])
        .unwrap();

    // An exact pattern beats an earlier regex.
    assert_eq!(
        map.resolve("encoder/pooler_transform/kernel", 2).unwrap().sharding_specs(),
        vec![UNSHARDED, "model"]
    );
    // Otherwise the earliest match wins over later ones.
    assert_eq!(
        map.resolve("encoder/pooler_dense/kernel", 2).unwrap().sharding_specs(),
        vec!["model", UNSHARDED]
    );
    // Patterns match at the start of the name only.
    assert!(map.get("bert/encoder/x").is_none());
}

#[test]
fn test_unmatched_parameters() {
    let mesh = mesh(0);
    let map = LayoutMap::new(&mesh);
    assert_eq!(map.resolve("anything", 3).unwrap(), Layout::replicated(&mesh, 3));

    let strict = default_layout_map(&mesh, "model")
        .unwrap()
        .with_policy(UnmatchedPolicy::Reject);
    let mut builder = ParameterBuilder::new(&strict, 0);
    let err = run_on(&mesh, || BertClassifier::new(small_config(), &mut builder))
        .err()
        .unwrap();
    assert!(
        matches!(&err, MeshError::Layout(msg) if msg.contains("word_embeddings")),
        "{err}"
    );
}

#[test]
fn test_rule_rank_must_match_parameter() {
    let mesh = mesh(0);
    let map = LayoutMap::new(&mesh)
        .rule(".*classifier/bias", &[UNSHARDED, UNSHARDED])
        .unwrap();
    let mut builder = ParameterBuilder::new(&map, 0);
    let err = run_on(&mesh, || BertClassifier::new(small_config(), &mut builder))
        .err()
        .unwrap();
    assert!(matches!(err, MeshError::Layout(_)), "{err}");
}

#[test]
fn test_unknown_mesh_dimension_in_rule() {
    let mesh = mesh(0);
    assert!(LayoutMap::new(&mesh).rule("x", &["tensor"]).is_err());
}

#[test]
fn test_same_seed_builds_same_blocks_on_every_client() {
    let values: Vec<Vec<f32>> = (0..2)
        .map(|client| {
            let mesh = mesh(client);
            let map = default_layout_map(&mesh, "model").unwrap();
            let mut builder = ParameterBuilder::new(&map, 11);
            let model = run_on(&mesh, || BertClassifier::new(small_config(), &mut builder)).unwrap();
            let params = model.trainable_parameters();
            params[0].local_shards()[0].1.to_vec()
        })
        .collect();
    assert_eq!(values[0], values[1]);
}
