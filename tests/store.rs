use camino::Utf8PathBuf;

use geneset_refinery::config::{DoSection, OrganismConfig, Secrets};
use geneset_refinery::download::{self, HttpDownloader};
use geneset_refinery::store::Store;

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

#[test]
fn organism_dirs_live_under_root() {
    let (_temp, root) = temp_root();
    let store = Store::new(root.join("cache"));
    let dir = store.ensure_organism_dir("human").unwrap();
    assert_eq!(dir, root.join("cache").join("human"));
    assert!(dir.as_std_path().is_dir());
}

#[test]
fn local_sources_are_copied_into_the_cache() {
    let (_temp, root) = temp_root();
    let obo = root.join("doid.obo");
    let tsv = root.join("assoc.tsv");
    std::fs::write(obo.as_std_path(), "format-version: 1.2\n").unwrap();
    std::fs::write(tsv.as_std_path(), "7157\tDOID:162\n").unwrap();

    let mut organism = OrganismConfig::new("human", "Homo sapiens");
    organism.disease_ontology = Some(DoSection {
        obo_url: format!("file://{obo}"),
        associations_url: tsv.to_string(),
        propagate: true,
        min_genes: 1,
    });

    let store = Store::new(root.join("cache"));
    let downloader = HttpDownloader::new(std::time::Duration::from_secs(5)).unwrap();
    let dir =
        download::download_organism_files(&downloader, &store, &organism, &Secrets::default())
            .unwrap();

    assert_eq!(
        std::fs::read_to_string(dir.join(DoSection::ASSOCIATIONS_FILE).as_std_path()).unwrap(),
        "7157\tDOID:162\n"
    );
    assert!(dir.join(DoSection::OBO_FILE).as_std_path().exists());
}
