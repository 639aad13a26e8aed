use checkly_operator::crd::all_crds;

fn main() {
    for crd in all_crds() {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd).unwrap());
    }
}
