use std::fs;

use neumf::{evaluate_model, prepare_dataset, train, Dataset, IdMapping, Learner, ModelConfig, NeuMF, RandomState, TrainConfig};

/// Two taste groups over twenty rooms: even users like even rooms, odd users
/// like odd rooms.
fn write_log(path: &std::path::Path) {
    let mut log = String::from("user,room,rating,ts\n");
    for user in 0..12 {
        let parity = user % 2;
        for (ts, room) in (0..20).filter(|r| r % 2 == parity).enumerate() {
            if (room + user) % 5 == 0 && ts > 0 {
                continue;
            }
            log.push_str(&format!("u{},room{},{},{}\n", user, room, 1 + room % 5, ts));
        }
    }
    fs::write(path, log).unwrap();
}

#[test]
fn prepare_train_reload_and_recommend() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("log.csv");
    write_log(&raw);
    let data_dir = dir.path().join("Data");
    prepare_dataset(&raw, b',', true, &data_dir, "rooms", 6, &mut RandomState::new(Some(1))).unwrap();

    let dataset = Dataset::load(&data_dir, "rooms").unwrap();
    assert_eq!(dataset.num_users(), 12);
    assert_eq!(dataset.num_items(), 20);
    assert_eq!(dataset.num_test(), 12);

    let model_config = ModelConfig {
        mf_dim: 4,
        layers: vec![16, 8, 4],
        reg_layers: vec![0.0, 0.0, 0.0],
        reg_mf: 0.0,
    };
    let out = dir.path().join("Pretrain").join("rooms.weights");
    let config = TrainConfig {
        epochs: 30,
        batch_size: 32,
        learning_rate: 0.01,
        learner: Learner::Adam,
        top_k: 3,
        num_threads: 2,
        id_headroom: 5,
        seed: Some(3),
        out: Some(out.clone()),
        ..TrainConfig::default()
    };
    let outcome = train(&dataset, &model_config, &config).unwrap();
    let first = outcome.histories.first().unwrap().loss;
    let last = outcome.histories.last().unwrap().loss;
    assert!(last < first, "loss went from {} to {}", first, last);

    // the saved weights are the best evaluated model
    let restored = NeuMF::load(&out).unwrap();
    let evaluation = evaluate_model(&restored, &dataset.test_ratings, &dataset.test_negatives, 3, 1).unwrap();
    assert!((evaluation.hit_ratio() - outcome.best_hr).abs() < 1e-6);

    let users = IdMapping::load(data_dir.join("user_mapping.csv")).unwrap();
    let rooms = IdMapping::load(data_dir.join("room_mapping.csv")).unwrap();
    let user = users.index_of("u4").unwrap();
    let top = restored.recommend(user, 5, Some(&dataset.train)).unwrap();
    assert_eq!(top.len(), 5);
    for (item, _) in &top {
        assert!(!dataset.train.row(user).col_indices().contains(item));
        assert!(rooms.id_of(*item).is_some());
    }
}

#[test]
fn pretrained_branches_start_training() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("log.csv");
    write_log(&raw);
    prepare_dataset(&raw, b',', true, dir.path(), "rooms", 4, &mut RandomState::new(Some(2))).unwrap();
    let dataset = Dataset::load(dir.path(), "rooms").unwrap();

    let model_config = ModelConfig {
        mf_dim: 4,
        layers: vec![8, 4],
        reg_layers: vec![0.0, 0.0],
        reg_mf: 0.0,
    };
    let base = TrainConfig {
        epochs: 3,
        batch_size: 64,
        id_headroom: 0,
        seed: Some(9),
        ..TrainConfig::default()
    };
    let mf_file = dir.path().join("gmf.weights");
    let mlp_file = dir.path().join("mlp.weights");
    train(&dataset, &model_config, &TrainConfig { out: Some(mf_file.clone()), ..base.clone() }).unwrap();
    train(&dataset, &model_config, &TrainConfig { out: Some(mlp_file.clone()), ..base.clone() }).unwrap();

    let config = TrainConfig {
        mf_pretrain: Some(mf_file),
        mlp_pretrain: Some(mlp_file),
        learner: Learner::Sgd,
        ..base
    };
    let outcome = train(&dataset, &model_config, &config).unwrap();
    assert_eq!(outcome.histories.len(), 3);
    assert!(outcome.out_file.is_none());
}
