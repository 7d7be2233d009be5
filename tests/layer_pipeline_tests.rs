use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::Path;

use layercache::oci::compression::decompress_file;
use layercache::oci::data::DataRef;
use layercache::oci::media::{layer_media_type, ImageConfig, RootFs};
use layercache::oci::{
    read_layout, repack_layout, write_layout, LayerUnpacker, MediaTypeRegistry, OciCompression, OciImageIndex,
    OciImageLayer, OciImageManifest, OciIndexEntry, OciNode, OpaqueWhiteoutPolicy, RepackOptions,
    RepositoryBuilder, TarEntryIndex,
};

enum Entry<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
}

fn tar_bytes(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(1_700_000_000);
        match entry {
            Entry::Dir(name) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, format!("{name}/"), std::io::empty())
                    .unwrap();
            }
            Entry::File(name, data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, name, *data).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn lower_layer() -> Vec<u8> {
    tar_bytes(&[
        Entry::File("a", b"from the lower layer"),
        Entry::Dir("dir"),
        Entry::File("dir/b", b"bee"),
    ])
}

fn upper_layer() -> Vec<u8> {
    tar_bytes(&[Entry::File(".wh.a", b""), Entry::File("dir/c", b"sea")])
}

fn write_source_layout(dir: &Path) {
    let registry = MediaTypeRegistry::standard();
    let layers = vec![
        OciImageLayer {
            media_type: layer_media_type(None),
            data: DataRef::Bytes(lower_layer().into()),
            info: None,
            annotations: None,
        },
        OciImageLayer {
            media_type: layer_media_type(Some(OciCompression::Gzip)),
            data: DataRef::Bytes(gzip(&upper_layer()).into()),
            info: None,
            annotations: None,
        },
    ];
    let config = ImageConfig {
        rootfs: RootFs {
            kind: "layers".to_string(),
            diff_ids: vec!["sha256:lower".to_string(), "sha256:upper".to_string()],
        },
        history: Some(vec![serde_json::json!({"created_by": "step 1"})]),
        ..Default::default()
    };

    let index = OciImageIndex::new(vec![OciIndexEntry::manifest(OciImageManifest::new(config, layers))]);
    let mut builder = RepositoryBuilder::new(&registry);
    let root = builder.add_data(OciNode::Index(&index)).unwrap();
    write_layout(&builder.build(root).unwrap(), dir).unwrap();
}

fn layer_contents(layer: &OciImageLayer, scratch: &Path, position: usize) -> Vec<(String, Vec<u8>)> {
    let DataRef::File(blob) = &layer.data else {
        panic!("layer {position} is not file backed");
    };
    let tar_path = scratch.join(format!("{position}.tar"));
    decompress_file(blob, &tar_path, None).unwrap();

    let mut archive = tar::Archive::new(std::fs::File::open(&tar_path).unwrap());
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (path, data)
        })
        .collect()
}

#[test]
fn repacked_image_reflects_whiteouts_and_overrides() {
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("source");
    let destination = root.path().join("destination");
    write_source_layout(&source);

    let registry = MediaTypeRegistry::standard();
    let index = repack_layout(&source, &destination, &registry, &RepackOptions::default()).unwrap();

    assert_eq!(index.manifests.len(), 1);
    let (_, manifest) = index.single_manifest().unwrap();
    assert_eq!(manifest.layers.len(), 1);
    assert_eq!(manifest.config.rootfs.diff_ids.len(), 1);
    assert!(manifest.config.history.is_none());

    let scratch = tempfile::tempdir().unwrap();
    let contents = layer_contents(&manifest.layers[0], scratch.path(), 0);
    let files: BTreeSet<&str> = contents
        .iter()
        .map(|(path, _)| path.as_str())
        .filter(|path| !path.ends_with('/'))
        .collect();
    assert_eq!(files, BTreeSet::from(["dir/b", "dir/c"]));

    let reread = read_layout(&destination, &registry).unwrap();
    let (_, reread_manifest) = reread.single_manifest().unwrap();
    assert_eq!(reread_manifest.config.rootfs.diff_ids, manifest.config.rootfs.diff_ids);
}

#[test]
fn repack_into_several_layers_keeps_every_file_once() {
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("source");
    let destination = root.path().join("destination");
    write_source_layout(&source);

    let options = RepackOptions {
        layers: 2,
        compression: Some(OciCompression::Zstd),
        ..Default::default()
    };
    let index = repack_layout(&source, &destination, &MediaTypeRegistry::standard(), &options).unwrap();
    let (_, manifest) = index.single_manifest().unwrap();
    assert!(!manifest.layers.is_empty() && manifest.layers.len() <= 2);
    assert_eq!(manifest.layers.len(), manifest.config.rootfs.diff_ids.len());

    let scratch = tempfile::tempdir().unwrap();
    let mut seen = Vec::new();
    for (position, layer) in manifest.layers.iter().enumerate() {
        assert!(layer.media_type.ends_with("+zstd"));
        for (path, data) in layer_contents(layer, scratch.path(), position) {
            if !path.ends_with('/') {
                seen.push((path, data));
            }
        }
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("dir/b".to_string(), b"bee".to_vec()),
            ("dir/c".to_string(), b"sea".to_vec()),
        ]
    );
}

#[test]
fn flattening_is_byte_identical_across_runs() {
    let root = tempfile::tempdir().unwrap();
    let lower = root.path().join("lower.tar");
    let upper = root.path().join("upper.tar");
    std::fs::write(&lower, lower_layer()).unwrap();
    std::fs::write(&upper, upper_layer()).unwrap();

    let mut outputs = Vec::new();
    for run in 0..2 {
        let index = TarEntryIndex::from_sources(&[&lower, &upper], OpaqueWhiteoutPolicy::Reject).unwrap();
        let output = root.path().join(format!("flat-{run}.tar"));
        LayerUnpacker::new(&index, &output).unpack().unwrap();
        outputs.push(std::fs::read(output).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}
