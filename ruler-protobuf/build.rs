// ruler - bitdrift's Prometheus rule evaluation node
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

fn main() -> Result<(), Box<dyn std::error::Error>> {
  if std::env::var_os("PROTOC").is_none() {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
  }
  tonic_build::compile_protos("proto/store.proto")?;
  Ok(())
}
