use appservice_operator::crd::AppService;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&AppService::crd())?);
    Ok(())
}
