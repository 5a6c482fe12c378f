use gantry_common::load_test::LoadTest;
use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&LoadTest::crd()).expect("CRD should serialize")
    );
}
