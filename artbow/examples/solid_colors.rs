use artbow::{
    class_histogram_key, evaluate, load_global, partial_palette_key, BatchLoader, ClassEncoding, ClassIndex,
    ClassificationTarget, Classify, Config, LabeledEntry, MemoryImages, MemoryStore, PaletteConfig, Trainer,
    CLASS_HISTOGRAMS, GLOBAL_PALETTE,
};
use image::{Rgb, RgbImage};

const COLORS: [(&str, [u8; 3]); 3] = [
    ("crimson", [200, 20, 40]),
    ("forest", [30, 120, 40]),
    ("navy", [20, 30, 110]),
];

fn noisy(color: [u8; 3], seed: u32) -> RgbImage {
    RgbImage::from_fn(48, 48, |x, y| {
        let jitter = ((x * 31 + y * 17 + seed * 7) % 21) as i16 - 10;
        Rgb(color.map(|c| (c as i16 + jitter).clamp(0, 255) as u8))
    })
}

fn main() {
    let config = Config {
        global_palette: PaletteConfig::new(6, 0.5),
        local_palette: PaletteConfig::new(4, 0.5).with_random(true),
        ..Config::default()
    };

    let encoding: ClassEncoding = COLORS
        .iter()
        .enumerate()
        .map(|(code, (name, _))| (code as u32, name.to_string()))
        .collect();
    let mut images = MemoryImages::new();
    let mut train = Vec::new();
    let mut validation = Vec::new();
    for (code, (name, color)) in COLORS.iter().enumerate() {
        for i in 0..6 {
            let path = format!("{name}/{i}.png");
            images.insert(&path, noisy(*color, i));
            let entry = LabeledEntry::new(path, code as u32);
            if i < 4 {
                train.push(entry);
            } else {
                validation.push(entry);
            }
        }
    }

    let index = ClassIndex::from_entries(&train, &encoding).unwrap();
    let loader = BatchLoader::new(ClassificationTarget::Style, encoding.clone(), index, images, 1 << 20);

    let mut store = MemoryStore::new();
    let global = Trainer::new(&config)
        .with_store(&mut store)
        .train_global(&loader)
        .unwrap();
    let local = Trainer::new(&config).train_local(&loader).unwrap();

    let classifiers: [(&str, &dyn Classify); 2] = [("global", &global), ("local", &local)];
    for (name, classifier) in classifiers {
        let evaluation = evaluate(&validation, classifier, &encoding, loader.images(), &mut ()).unwrap();
        println!("{name}: {evaluation}");
    }
    for key in [
        partial_palette_key(0),
        GLOBAL_PALETTE.to_owned(),
        CLASS_HISTOGRAMS.to_owned(),
        class_histogram_key("navy"),
    ] {
        assert!(store.contains(&key), "{key} missing");
    }
    let reloaded = load_global(&store, &config).unwrap();
    assert_eq!(reloaded.palette(), global.palette());
    println!("{} artifacts kept in memory", store.len());
}
