use kube::core::CustomResourceExt;
use ngc_operator::crd::gateway_bundle::GatewayBundle;
use ngc_operator::crd::inference_stack::InferenceStack;

fn main() -> anyhow::Result<()> {
    let docs = [
        serde_yaml::to_string(&InferenceStack::crd())?,
        serde_yaml::to_string(&GatewayBundle::crd())?,
    ];
    println!("{}", docs.join("---\n"));
    Ok(())
}
